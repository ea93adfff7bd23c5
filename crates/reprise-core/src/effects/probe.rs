//! Container-level probing with lofty.
//!
//! Used when the decoder's codec parameters carry no frame count (VBR MP3
//! without a Xing header, some AAC streams).

use std::path::Path;

use lofty::prelude::*;
use lofty::probe::Probe;

/// Total duration of a local file in milliseconds.
pub fn duration_ms(path: &Path) -> Option<u64> {
    let tagged = match Probe::open(path).and_then(|p| p.read()) {
        Ok(t) => t,
        Err(e) => {
            log::debug!("reprise: lofty probe failed for {}: {}", path.display(), e);
            return None;
        }
    };
    Some(tagged.properties().duration().as_millis() as u64).filter(|&d| d > 0)
}
