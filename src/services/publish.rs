//! Artifact publication: object-storage replacement and git archival.
//!
//! Object storage is any S3-compatible endpoint (Cloudflare R2 in production);
//! requests are signed with AWS Signature V4 over plain `ureq` calls.

use chrono::{DateTime, NaiveDate, Utc};
use hmac::{Hmac, Mac};
use log::{debug, info, warn};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Everything except the unreserved set and `/` is escaped in object paths.
const PATH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

#[derive(Debug)]
pub enum PublishError {
    Io(String),
    Http { status: u16, message: String },
    Transport(String),
    Git(String),
    NothingToUpload,
}

impl core::fmt::Display for PublishError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PublishError::Io(s) => write!(f, "io error: {}", s),
            PublishError::Http { status, message } => write!(f, "http {}: {}", status, message),
            PublishError::Transport(s) => write!(f, "transport error: {}", s),
            PublishError::Git(s) => write!(f, "git failed: {}", s),
            PublishError::NothingToUpload => write!(f, "no artifact files found to upload"),
        }
    }
}

impl std::error::Error for PublishError {}

impl From<ureq::Error> for PublishError {
    fn from(value: ureq::Error) -> Self {
        match value {
            ureq::Error::StatusCode(status) => PublishError::Http {
                status,
                message: String::new(),
            },
            other => PublishError::Transport(other.to_string()),
        }
    }
}

pub trait Publisher {
    /// Replace the remote copies of `filenames` (relative to `dir`): prior
    /// objects under the same keys are deleted before the new ones are uploaded.
    fn replace_artifacts(&self, dir: &Path, filenames: &[String]) -> Result<(), PublishError>;

    /// Record `changed` in version control for `run_date`. Having nothing to
    /// record is a success.
    fn snapshot_and_push(&self, changed: &[PathBuf], run_date: NaiveDate) -> Result<(), PublishError>;
}

#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub access_key_id: String,
    pub secret_access_key: String,
    /// e.g. `https://<account>.r2.cloudflarestorage.com`
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub prefix: String,
}

pub struct ObjectStorePublisher {
    agent: ureq::Agent,
    cfg: ObjectStoreConfig,
    host: String,
}

const SERVICE: &str = "s3";
const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn derive_signing_key(secret: &str, datestamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), datestamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

fn uri_encode_path(path: &str) -> String {
    utf8_percent_encode(path, PATH_ENCODE_SET).to_string()
}

/// Headers that must accompany a signed request.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedHeaders {
    pub authorization: String,
    pub amz_date: String,
    pub content_sha256: String,
}

impl ObjectStorePublisher {
    pub fn new(cfg: ObjectStoreConfig, timeout: Duration) -> Result<Self, String> {
        let host = cfg
            .endpoint
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&cfg.endpoint)
            .split('/')
            .next()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| format!("R2_ENDPOINT has no host: {}", cfg.endpoint))?
            .to_string();
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();
        Ok(ObjectStorePublisher { agent, cfg, host })
    }

    fn key_for(&self, filename: &str) -> String {
        format!("{}{}", self.cfg.prefix, filename)
    }

    fn canonical_uri(&self, key: &str) -> String {
        uri_encode_path(&format!("/{}/{}", self.cfg.bucket, key))
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}{}", self.cfg.endpoint.trim_end_matches('/'), self.canonical_uri(key))
    }

    pub fn sign(&self, method: &str, key: &str, payload: &[u8], at: DateTime<Utc>) -> SignedHeaders {
        let amz_date = at.format("%Y%m%dT%H%M%SZ").to_string();
        let datestamp = at.format("%Y%m%d").to_string();
        let content_sha256 = sha256_hex(payload);

        let canonical_request = format!(
            "{}\n{}\n\nhost:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n\n{}\n{}",
            method,
            self.canonical_uri(key),
            self.host,
            content_sha256,
            amz_date,
            SIGNED_HEADERS,
            content_sha256
        );
        let scope = format!("{}/{}/{}/aws4_request", datestamp, self.cfg.region, SERVICE);
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            amz_date,
            scope,
            sha256_hex(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(&self.cfg.secret_access_key, &datestamp, &self.cfg.region, SERVICE);
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        SignedHeaders {
            authorization: format!(
                "{} Credential={}/{}, SignedHeaders={}, Signature={}",
                ALGORITHM, self.cfg.access_key_id, scope, SIGNED_HEADERS, signature
            ),
            amz_date,
            content_sha256,
        }
    }

    fn check_status(mut res: http::Response<ureq::Body>) -> Result<(), PublishError> {
        let status = res.status();
        if status.is_success() {
            return Ok(());
        }
        let message = res.body_mut().read_to_string().unwrap_or_default();
        Err(PublishError::Http {
            status: status.as_u16(),
            message,
        })
    }

    fn delete_object(&self, key: &str) -> Result<(), PublishError> {
        let signed = self.sign("DELETE", key, b"", Utc::now());
        let res = self
            .agent
            .delete(&self.url_for(key))
            .header("x-amz-date", &signed.amz_date)
            .header("x-amz-content-sha256", &signed.content_sha256)
            .header("Authorization", &signed.authorization)
            .call()?;
        // Deleting an absent key is not an error.
        if res.status() == http::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check_status(res)
    }

    fn put_object(&self, key: &str, body: &[u8]) -> Result<(), PublishError> {
        let signed = self.sign("PUT", key, body, Utc::now());
        let res = self
            .agent
            .put(&self.url_for(key))
            .header("x-amz-date", &signed.amz_date)
            .header("x-amz-content-sha256", &signed.content_sha256)
            .header("Authorization", &signed.authorization)
            .header("Content-Type", "application/json")
            .send(body)?;
        Self::check_status(res)
    }

    /// Uploads whichever of `filenames` exist under `dir`, after deleting
    /// their previous objects.
    pub fn replace_artifacts(&self, dir: &Path, filenames: &[String]) -> Result<(), PublishError> {
        let mut present = Vec::with_capacity(filenames.len());
        for name in filenames {
            let path = dir.join(name);
            if path.is_file() {
                present.push((name, path));
            } else {
                warn!("Publish: artifact missing, skipping: {}", path.display());
            }
        }
        if present.is_empty() {
            return Err(PublishError::NothingToUpload);
        }

        for (name, _) in &present {
            self.delete_object(&self.key_for(name))?;
        }
        info!("Publish: deleted {} previous object(s)", present.len());

        for (name, path) in &present {
            let body = fs::read(path).map_err(|e| PublishError::Io(format!("{}: {}", path.display(), e)))?;
            let key = self.key_for(name);
            self.put_object(&key, &body)?;
            debug!("Publish: uploaded {} ({} bytes)", key, body.len());
        }
        info!("Publish: uploaded {} object(s) to bucket {}", present.len(), self.cfg.bucket);
        Ok(())
    }
}

pub fn commit_message(run_date: NaiveDate) -> String {
    format!("Daily data export - {}", run_date.format("%Y-%m-%d"))
}

/// Commits exported data into the git checkout at `repo_dir` and pushes it.
pub struct GitArchive {
    pub repo_dir: PathBuf,
}

impl GitArchive {
    fn git(&self, args: &[&str]) -> Result<std::process::Output, PublishError> {
        Command::new("git")
            .args(args)
            .current_dir(&self.repo_dir)
            .output()
            .map_err(|e| PublishError::Git(format!("spawning git {}: {}", args.join(" "), e)))
    }

    /// `git add`, `git commit`, `git push`. A commit that finds nothing to
    /// record ends the snapshot successfully without pushing.
    pub fn snapshot_and_push(&self, changed: &[PathBuf], run_date: NaiveDate) -> Result<(), PublishError> {
        if changed.is_empty() {
            return Ok(());
        }

        let paths: Vec<String> = changed.iter().map(|p| p.to_string_lossy().into_owned()).collect();
        let mut add_args = vec!["add", "--"];
        add_args.extend(paths.iter().map(String::as_str));
        let add = self.git(&add_args)?;
        if !add.status.success() {
            return Err(PublishError::Git(format!(
                "git add: {}",
                String::from_utf8_lossy(&add.stderr).trim()
            )));
        }

        let message = commit_message(run_date);
        let commit = self.git(&["commit", "-m", &message])?;
        if !commit.status.success() {
            info!("Publish: nothing new to commit");
            return Ok(());
        }

        let push = self.git(&["push"])?;
        if !push.status.success() {
            return Err(PublishError::Git(format!(
                "git push: {}",
                String::from_utf8_lossy(&push.stderr).trim()
            )));
        }
        info!("Publish: committed and pushed \"{}\"", message);
        Ok(())
    }
}

/// Object storage and git archival, either of which may be disabled.
#[derive(Default)]
pub struct ReleasePublisher {
    pub object_store: Option<ObjectStorePublisher>,
    pub git: Option<GitArchive>,
}

impl Publisher for ReleasePublisher {
    fn replace_artifacts(&self, dir: &Path, filenames: &[String]) -> Result<(), PublishError> {
        match &self.object_store {
            Some(p) => p.replace_artifacts(dir, filenames),
            None => {
                debug!("Publish: object storage not configured, skipping upload");
                Ok(())
            }
        }
    }

    fn snapshot_and_push(&self, changed: &[PathBuf], run_date: NaiveDate) -> Result<(), PublishError> {
        match &self.git {
            Some(g) => g.snapshot_and_push(changed, run_date),
            None => {
                debug!("Publish: git snapshot disabled, skipping");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn publisher() -> ObjectStorePublisher {
        ObjectStorePublisher::new(
            ObjectStoreConfig {
                access_key_id: "AKIDEXAMPLE".to_string(),
                secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
                endpoint: "https://account.r2.cloudflarestorage.com/".to_string(),
                bucket: "parking".to_string(),
                region: "auto".to_string(),
                prefix: "heatmaps/".to_string(),
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn signing_key_matches_published_vector() {
        let key = derive_signing_key("wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY", "20120215", "us-east-1", "iam");
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn empty_payload_hash_is_well_known() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn host_and_urls_come_from_endpoint() {
        let p = publisher();
        assert_eq!(p.host, "account.r2.cloudflarestorage.com");
        let key = p.key_for("7d.json");
        assert_eq!(key, "heatmaps/7d.json");
        assert_eq!(
            p.url_for(&key),
            "https://account.r2.cloudflarestorage.com/parking/heatmaps/7d.json"
        );
        assert_eq!(uri_encode_path("/b/a key+1.json"), "/b/a%20key%2B1.json");
    }

    #[test]
    fn object_paths_escape_reserved_and_non_ascii_bytes() {
        assert_eq!(uri_encode_path("/bucket/heat-maps_v1/~7d.json"), "/bucket/heat-maps_v1/~7d.json");
        assert_eq!(uri_encode_path("/b/caf\u{e9}.json"), "/b/caf%C3%A9.json");
        assert_eq!(uri_encode_path("/b/a=1&b?c#d"), "/b/a%3D1%26b%3Fc%23d");
        assert_eq!(uri_encode_path("/b/100%"), "/b/100%25");
    }

    #[test]
    fn authorization_header_is_scoped_and_deterministic() {
        let p = publisher();
        let at = Utc.with_ymd_and_hms(2025, 3, 8, 6, 2, 0).unwrap();
        let a = p.sign("PUT", "heatmaps/7d.json", b"{}", at);
        let b = p.sign("PUT", "heatmaps/7d.json", b"{}", at);
        assert_eq!(a, b);
        assert_eq!(a.amz_date, "20250308T060200Z");
        assert!(a.authorization.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20250308/auto/s3/aws4_request, \
             SignedHeaders=host;x-amz-content-sha256;x-amz-date, Signature="
        ));
        let signature = a.authorization.rsplit('=').next().unwrap();
        assert_eq!(signature.len(), 64);

        let other = p.sign("DELETE", "heatmaps/7d.json", b"", at);
        assert_ne!(other.authorization, a.authorization);
    }

    #[test]
    fn endpoint_without_host_is_rejected() {
        let mut cfg = publisher().cfg;
        cfg.endpoint = "https://".to_string();
        assert!(ObjectStorePublisher::new(cfg, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn missing_files_mean_nothing_to_upload() {
        let dir = std::env::temp_dir().join(format!("parking-publish-{}", std::process::id()));
        let err = publisher()
            .replace_artifacts(&dir, &["7d.json".to_string()])
            .unwrap_err();
        assert!(matches!(err, PublishError::NothingToUpload));
    }

    #[test]
    fn commit_message_names_the_run_date() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 8).unwrap();
        assert_eq!(commit_message(date), "Daily data export - 2025-03-08");
    }

    #[test]
    fn disabled_halves_are_no_ops() {
        let publisher = ReleasePublisher::default();
        let date = NaiveDate::from_ymd_opt(2025, 3, 8).unwrap();
        assert!(publisher.replace_artifacts(Path::new("missing"), &[]).is_ok());
        assert!(publisher.snapshot_and_push(&[PathBuf::from("data")], date).is_ok());
    }
}
