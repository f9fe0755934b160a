//! Granule Locator
//!
//! Finds the granule directories of a Sentinel-2 scene and the single image
//! file of a band inside each granule. Lookups are plain directory listings
//! filtered by regular expressions; entries are visited in sorted order so
//! every run composites tiles identically.

use crate::io::raster::{RasterBackend, RasterHandle};
use crate::types::{Footprint, FuseError, FuseResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory layout of band files inside `IMG_DATA`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "layout", rename_all = "snake_case")]
pub enum GranuleLayout {
    /// `IMG_DATA/*_B<code>.jp2`
    Raw,
    /// `IMG_DATA/R<res>m/*_B<code>_<res>m.jp2`
    ResolutionSubdir { resolution_m: u32 },
}

impl Default for GranuleLayout {
    fn default() -> Self {
        GranuleLayout::Raw
    }
}

impl GranuleLayout {
    fn band_dir(&self, img_data: &Path) -> PathBuf {
        match self {
            GranuleLayout::Raw => img_data.to_path_buf(),
            GranuleLayout::ResolutionSubdir { resolution_m } => img_data.join(format!("R{}m", resolution_m)),
        }
    }

    fn band_pattern(&self, band_code: &str) -> FuseResult<Regex> {
        let code = regex::escape(band_code);
        let pattern = match self {
            GranuleLayout::Raw => format!(r"_B{}\.jp2$", code),
            GranuleLayout::ResolutionSubdir { resolution_m } => format!(r"_B{}_{}m\.jp2$", code, resolution_m),
        };
        Regex::new(&pattern).map_err(|e| FuseError::Config(format!("Invalid band pattern: {}", e)))
    }
}

/// One granule directory of a scene
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Granule {
    pub id: String,
    pub dir: PathBuf,
}

impl Granule {
    pub fn img_data(&self) -> PathBuf {
        self.dir.join("IMG_DATA")
    }

    /// Directory name, the compositing sort key
    pub fn dir_name(&self) -> String {
        self.dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// One band file of one granule
#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    pub path: PathBuf,
    pub granule_id: String,
    pub band_code: String,
    pub resolution_m: Option<u32>,
}

/// Locates granules and band files below a scene root
#[derive(Debug, Clone)]
pub struct GranuleLocator {
    scene_root: PathBuf,
    layout: GranuleLayout,
}

impl GranuleLocator {
    pub fn new<P: AsRef<Path>>(scene_root: P, layout: GranuleLayout) -> Self {
        Self {
            scene_root: scene_root.as_ref().to_path_buf(),
            layout,
        }
    }

    pub fn scene_root(&self) -> &Path {
        &self.scene_root
    }

    pub fn layout(&self) -> GranuleLayout {
        self.layout
    }

    /// Granule directories `GRANULE/*_T<id>_*` for each requested id.
    ///
    /// An id without a directory is logged and skipped; finding no granule at
    /// all is an error.
    pub fn find_granules(&self, ids: &[String]) -> FuseResult<Vec<Granule>> {
        let granule_root = self.scene_root.join("GRANULE");
        let entries = sorted_entries(&granule_root)?;

        let mut granules = Vec::new();
        for id in ids {
            let marker = format!("_T{}_", id);
            let matches: Vec<&PathBuf> = entries
                .iter()
                .filter(|p| p.is_dir() && file_name(p).contains(&marker))
                .collect();

            match matches.as_slice() {
                [] => log::warn!("Granule {} not found under {}", id, granule_root.display()),
                found => {
                    if found.len() > 1 {
                        log::warn!("Granule {} matches {} directories, using all", id, found.len());
                    }
                    for dir in found {
                        granules.push(Granule {
                            id: id.clone(),
                            dir: (*dir).clone(),
                        });
                    }
                }
            }
        }

        if granules.is_empty() {
            return Err(FuseError::NotFound(format!(
                "No granules of {:?} under {}",
                ids,
                granule_root.display()
            )));
        }

        granules.sort_by_key(|g| g.dir_name());
        log::info!("Located {} granules in {}", granules.len(), self.scene_root.display());
        Ok(granules)
    }

    /// The unique image file of `band_code` in `granule`.
    ///
    /// No candidate is [`FuseError::NotFound`], several are [`FuseError::Ambiguous`].
    pub fn band_file(&self, granule: &Granule, band_code: &str) -> FuseResult<PathBuf> {
        let dir = self.layout.band_dir(&granule.img_data());
        let pattern = self.layout.band_pattern(band_code)?;

        let mut candidates: Vec<PathBuf> = match sorted_entries(&dir) {
            Ok(entries) => entries
                .into_iter()
                .filter(|p| p.is_file() && pattern.is_match(&file_name(p)))
                .collect(),
            Err(_) => Vec::new(),
        };

        match candidates.len() {
            1 => Ok(candidates.remove(0)),
            0 => Err(FuseError::NotFound(format!(
                "No B{} file in {}",
                band_code,
                dir.display()
            ))),
            n => Err(FuseError::Ambiguous(format!(
                "{} candidate B{} files in {}: {:?}",
                n,
                band_code,
                dir.display(),
                candidates
            ))),
        }
    }

    /// Tiles of `band_code` across granules, in granule order
    pub fn tiles(&self, granules: &[Granule], band_code: &str) -> Vec<FuseResult<Tile>> {
        let resolution_m = match self.layout {
            GranuleLayout::Raw => None,
            GranuleLayout::ResolutionSubdir { resolution_m } => Some(resolution_m),
        };
        granules
            .iter()
            .map(|granule| {
                self.band_file(granule, band_code).map(|path| Tile {
                    path,
                    granule_id: granule.id.clone(),
                    band_code: band_code.to_string(),
                    resolution_m,
                })
            })
            .collect()
    }

    /// Footprints of one reference band across granules, plus the projection
    /// of the first tile read
    pub fn footprints<B: RasterBackend>(
        &self,
        backend: &B,
        granules: &[Granule],
        band_code: &str,
    ) -> FuseResult<(Vec<Footprint>, String)> {
        let mut footprints = Vec::new();
        let mut projection = None;

        for tile in self.tiles(granules, band_code) {
            let tile = match tile {
                Ok(tile) => tile,
                Err(e) if e.is_recoverable() => {
                    log::warn!("Skipping footprint: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let handle = backend.open(&tile.path)?;
            if projection.is_none() {
                projection = Some(handle.projection());
            }
            let footprint = handle.corners()?;
            log::debug!("Footprint of {}: {:?}", tile.granule_id, footprint.corners);
            footprints.push(footprint);
        }

        let projection = projection.ok_or_else(|| {
            FuseError::NotFound(format!("No B{} tiles to take footprints from", band_code))
        })?;
        Ok((footprints, projection))
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn sorted_entries(dir: &Path) -> FuseResult<Vec<PathBuf>> {
    let mut entries = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scene_with_granules(root: &Path, names: &[&str]) {
        for name in names {
            fs::create_dir_all(root.join("GRANULE").join(name).join("IMG_DATA")).unwrap();
        }
    }

    #[test]
    fn test_find_granules_sorted_and_missing_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        scene_with_granules(
            tmp.path(),
            &["L1C_T16TFR_A005_20160602", "L1C_T16TER_A005_20160602"],
        );
        let locator = GranuleLocator::new(tmp.path(), GranuleLayout::Raw);

        let ids: Vec<String> = ["16TFR", "16TER", "16TEQ"].iter().map(|s| s.to_string()).collect();
        let granules = locator.find_granules(&ids).unwrap();
        assert_eq!(granules.len(), 2);
        assert_eq!(granules[0].id, "16TER");
        assert_eq!(granules[1].id, "16TFR");

        let none = vec!["99XXX".to_string()];
        assert!(matches!(locator.find_granules(&none), Err(FuseError::NotFound(_))));
    }

    #[test]
    fn test_band_file_requires_unique_match() {
        let tmp = tempfile::tempdir().unwrap();
        scene_with_granules(tmp.path(), &["L1C_T16TER_A005"]);
        let img = tmp.path().join("GRANULE/L1C_T16TER_A005/IMG_DATA");
        fs::write(img.join("T16TER_20160602_B01.jp2"), b"").unwrap();
        fs::write(img.join("T16TER_20160602_B02.jp2"), b"").unwrap();
        fs::write(img.join("OLD_T16TER_B02.jp2"), b"").unwrap();

        let locator = GranuleLocator::new(tmp.path(), GranuleLayout::Raw);
        let granule = &locator.find_granules(&["16TER".to_string()]).unwrap()[0];

        assert!(locator.band_file(granule, "01").unwrap().ends_with("T16TER_20160602_B01.jp2"));
        let conflict = locator.band_file(granule, "02").unwrap_err();
        assert!(matches!(conflict, FuseError::Ambiguous(_)));
        assert!(conflict.is_recoverable());
        assert!(matches!(locator.band_file(granule, "03"), Err(FuseError::NotFound(_))));
    }

    #[test]
    fn test_resolution_subdir_layout() {
        let tmp = tempfile::tempdir().unwrap();
        scene_with_granules(tmp.path(), &["L2A_T16TER_A005"]);
        let r60 = tmp.path().join("GRANULE/L2A_T16TER_A005/IMG_DATA/R60m");
        fs::create_dir_all(&r60).unwrap();
        fs::write(r60.join("T16TER_20160602_B05_60m.jp2"), b"").unwrap();

        let locator = GranuleLocator::new(tmp.path(), GranuleLayout::ResolutionSubdir { resolution_m: 60 });
        let granules = locator.find_granules(&["16TER".to_string()]).unwrap();
        let tiles = locator.tiles(&granules, "05");
        let tile = tiles[0].as_ref().unwrap();
        assert_eq!(tile.resolution_m, Some(60));
        assert!(tile.path.ends_with("R60m/T16TER_20160602_B05_60m.jp2"));
    }
}
