//! Point-to-neighborhood resolution against a static polygon set.
//!
//! The region set is loaded once at startup from a JSON file or URL and is
//! immutable afterwards, so the resolver is shared across decode paths via
//! `Arc` with no locking. Lookup is a bounding-box pre-check followed by
//! even-odd ray casting; the first matching region wins.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::info;

use crate::fetch::load_bytes;

/// Label attached to coordinates that fall inside no configured region.
/// Not an error: unresolvable rides stay in the pipeline under this label.
pub const UNRESOLVED: &str = "Unresolved";

/// On-disk shape of one region: a name and a closed polygon ring of
/// `[longitude, latitude]` vertices.
#[derive(Debug, Deserialize)]
struct RegionSpec {
    name: String,
    polygon: Vec<[f64; 2]>,
}

#[derive(Debug)]
struct Region {
    name: String,
    ring: Vec<[f64; 2]>,
    // (min_lon, min_lat, max_lon, max_lat)
    bbox: (f64, f64, f64, f64),
}

impl Region {
    fn contains(&self, lon: f64, lat: f64) -> bool {
        let (min_lon, min_lat, max_lon, max_lat) = self.bbox;
        if lon < min_lon || lon > max_lon || lat < min_lat || lat > max_lat {
            return false;
        }
        point_in_ring(lon, lat, &self.ring)
    }
}

/// Read-only spatial index mapping (longitude, latitude) to a region label.
#[derive(Debug)]
pub struct GeoResolver {
    regions: Vec<Region>,
}

impl GeoResolver {
    /// Builds a resolver from the JSON region document.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let specs: Vec<RegionSpec> =
            serde_json::from_slice(bytes).context("parsing region geometry JSON")?;
        let mut regions = Vec::with_capacity(specs.len());
        for spec in specs {
            if spec.polygon.len() < 3 {
                bail!(
                    "region '{}' has {} vertices, need at least 3",
                    spec.name,
                    spec.polygon.len()
                );
            }
            let mut bbox = (f64::MAX, f64::MAX, f64::MIN, f64::MIN);
            for [lon, lat] in &spec.polygon {
                bbox.0 = bbox.0.min(*lon);
                bbox.1 = bbox.1.min(*lat);
                bbox.2 = bbox.2.max(*lon);
                bbox.3 = bbox.3.max(*lat);
            }
            regions.push(Region {
                name: spec.name,
                ring: spec.polygon,
                bbox,
            });
        }
        Ok(Self { regions })
    }

    /// Loads the region set from a file path or URL. Failure here is a
    /// startup error; the pipeline does not run without geometry.
    pub async fn load(source: &str) -> Result<Self> {
        let bytes = load_bytes(source)
            .await
            .with_context(|| format!("loading geometry source '{source}'"))?;
        let resolver = Self::from_json(&bytes)?;
        info!(
            source,
            region_count = resolver.regions.len(),
            "geometry loaded"
        );
        Ok(resolver)
    }

    /// Resolves a coordinate pair to a region label. Pure and thread-safe;
    /// coordinates outside every region (or non-finite) resolve to
    /// [`UNRESOLVED`].
    pub fn resolve(&self, lon: f64, lat: f64) -> &str {
        if !lon.is_finite() || !lat.is_finite() {
            return UNRESOLVED;
        }
        self.regions
            .iter()
            .find(|r| r.contains(lon, lat))
            .map_or(UNRESOLVED, |r| r.name.as_str())
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }
}

/// Even-odd ray casting against a closed ring.
fn point_in_ring(lon: f64, lat: f64, ring: &[[f64; 2]]) -> bool {
    let mut inside = false;
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        let [xi, yi] = ring[i];
        let [xj, yj] = ring[j];
        if (yi > lat) != (yj > lat) && lon < (xj - xi) * (lat - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}
