//! Tracked parking lots and the occupancy pair sampled for each of them.

use crate::models::fopark::SpotStatus;
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LotId(pub i32);

/// One occupied/available sample for a lot.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occupancy {
    pub occupied: i32,
    pub available: i32,
}

impl Occupancy {
    pub fn capacity(&self) -> i64 {
        i64::from(self.occupied) + i64::from(self.available)
    }

    /// Occupied share of capacity in percent, or `None` for an empty pool.
    pub fn rate(&self) -> Option<f64> {
        occupancy_rate(self.occupied, self.available)
    }
}

pub fn occupancy_rate(occupied: i32, available: i32) -> Option<f64> {
    // Widened so counts near i32::MAX cannot overflow.
    let capacity = i64::from(occupied) + i64::from(available);
    if capacity > 0 {
        Some(occupied as f64 / capacity as f64 * 100.0)
    } else {
        None
    }
}

/// Picks the spots of a vendor `lot_status` array that make up the tracked pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SpotSelector {
    /// Spots whose `coords` string is one of these.
    Coords { coords: Vec<String> },
    /// Array positions `start..end`.
    Positions { start: usize, end: usize },
}

impl SpotSelector {
    /// Number of spots in the pool, as far as the selector alone can tell.
    pub fn pool_size(&self) -> usize {
        match self {
            SpotSelector::Coords { coords } => coords.len(),
            SpotSelector::Positions { start, end } => end.saturating_sub(*start),
        }
    }

    /// Status 1 counts as occupied, 0 as available; anything else is ignored.
    pub fn count(&self, spots: &[SpotStatus]) -> Occupancy {
        let mut occupancy = Occupancy::default();
        let mut tally = |spot: &SpotStatus| match spot.status {
            1 => occupancy.occupied += 1,
            0 => occupancy.available += 1,
            _ => {}
        };
        match self {
            SpotSelector::Coords { coords } => spots
                .iter()
                .filter(|s| s.coords.as_ref().is_some_and(|c| coords.contains(c)))
                .for_each(&mut tally),
            SpotSelector::Positions { start, end } => spots
                .iter()
                .skip(*start)
                .take(end.saturating_sub(*start))
                .for_each(&mut tally),
        }
        occupancy
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotSource {
    pub url: String,
    pub selector: SpotSelector,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lot {
    pub id: LotId,
    /// Key used in the published heatmap artifacts and CSV exports.
    pub name: String,
    pub source: LotSource,
}

const FOPARK_OCCUPANCY_URL: &str = "https://api6.fopark-api.com/lot/occupancy?client_name=auburn&name=";

/// Built-in catalog used when no `LOTS_FILE` is configured.
pub fn default_catalog() -> Vec<Lot> {
    let coords = |values: &[&str]| SpotSelector::Coords {
        coords: values.iter().map(|v| v.to_string()).collect(),
    };

    vec![
        Lot {
            id: LotId(1),
            name: "Stadium_Deck".to_string(),
            source: LotSource {
                url: format!("{FOPARK_OCCUPANCY_URL}au-stdm-grg-lvl1"),
                // EV stalls 33, 34, 35 and 134
                selector: coords(&[
                    "32.600559201904154,-85.48814522453688",
                    "32.60053102304166,-85.48814664785039",
                    "32.600503882656454,-85.48814530674588",
                    "32.600475642272514,-85.48814396564137",
                ]),
            },
        },
        Lot {
            id: LotId(2),
            name: "Athletics_Deck".to_string(),
            source: LotSource {
                url: format!("{FOPARK_OCCUPANCY_URL}au-athletic-grg-lvl1"),
                selector: SpotSelector::Positions { start: 121, end: 125 },
            },
        },
        Lot {
            id: LotId(3),
            name: "Haley_Deck".to_string(),
            source: LotSource {
                url: format!("{FOPARK_OCCUPANCY_URL}au-west2"),
                selector: coords(&[
                    "32.60308136711112,-85.50106216197128",
                    "32.60305318310657,-85.50106213252354",
                ]),
            },
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spot(status: i64, coords: &str) -> SpotStatus {
        SpotStatus {
            status,
            coords: Some(coords.to_string()),
        }
    }

    #[test]
    fn coords_selector_counts_only_listed_spots() {
        let selector = SpotSelector::Coords {
            coords: vec!["a".into(), "b".into(), "c".into()],
        };
        let spots = [spot(1, "a"), spot(0, "b"), spot(1, "x"), spot(1, "c"), spot(2, "a")];
        assert_eq!(
            selector.count(&spots),
            Occupancy {
                occupied: 2,
                available: 1
            }
        );
    }

    #[test]
    fn positions_selector_slices_the_status_array() {
        let selector = SpotSelector::Positions { start: 2, end: 5 };
        let spots: Vec<_> = [1, 1, 0, 1, 0, 1].iter().map(|s| spot(*s, "-")).collect();
        assert_eq!(
            selector.count(&spots),
            Occupancy {
                occupied: 1,
                available: 2
            }
        );
        // A short array yields whatever is inside the range.
        assert_eq!(selector.count(&spots[..3]).capacity(), 1);
    }

    #[test]
    fn rate_is_undefined_for_empty_pool() {
        assert_eq!(occupancy_rate(0, 0), None);
        assert_eq!(occupancy_rate(3, 1), Some(75.0));
        assert_eq!(Occupancy { occupied: 1, available: 3 }.rate(), Some(25.0));
    }

    #[test]
    fn rate_handles_counts_at_the_i32_limit() {
        let rate = occupancy_rate(i32::MAX, 1).unwrap();
        assert!((rate - 100.0).abs() < 1e-6);
        let full = Occupancy { occupied: i32::MAX, available: i32::MAX };
        assert_eq!(full.capacity(), 2 * i64::from(i32::MAX));
        assert_eq!(full.rate(), Some(50.0));
    }

    #[test]
    fn default_catalog_has_unique_ids_and_names() {
        let lots = default_catalog();
        assert_eq!(lots.len(), 3);
        assert_eq!(lots[1].source.selector.pool_size(), 4);
        assert!(lots.iter().any(|l| l.name == "Haley_Deck" && l.id == LotId(3)));
        let mut ids: Vec<_> = lots.iter().map(|l| l.id).collect();
        ids.dedup();
        assert_eq!(ids.len(), lots.len());
    }

    #[test]
    fn selector_round_trips_through_catalog_json() {
        let json = r#"{"kind":"positions","start":121,"end":125}"#;
        let selector: SpotSelector = serde_json::from_str(json).unwrap();
        assert_eq!(selector, SpotSelector::Positions { start: 121, end: 125 });
    }
}
