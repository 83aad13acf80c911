// Hardware page-table boundary.
//
// The region manager decides what is mapped where; programming the MMU is
// somebody else's job. `map` is the only fallible call (frame
// exhaustion); protection flips and unmapping release resources and must
// not fail.

use super::region::Region;
use crate::err::ErrorCode;

pub trait PageTableController: Send + Sync {
    /// Installs translations for a newly created region.
    fn map(&self, region: &Region) -> Result<(), ErrorCode>;

    /// Re-applies a region's current protection (and backing) to already
    /// installed translations.
    fn remap(&self, region: &Region);

    /// Drops a region's translations. `release_range` is false when the
    /// virtual range stays reserved (e.g. the backing is being swapped
    /// out from under the same range).
    fn unmap(&self, region: &Region, release_range: bool);
}

/// Does nothing. For hosted tests and for address spaces that are torn
/// down before ever running.
pub struct NullPageTable;

impl PageTableController for NullPageTable {
    fn map(&self, _region: &Region) -> Result<(), ErrorCode> {
        Ok(())
    }

    fn remap(&self, _region: &Region) {}

    fn unmap(&self, _region: &Region, _release_range: bool) {}
}
