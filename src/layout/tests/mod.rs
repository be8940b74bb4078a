use crate::layout::region::{Region, RegionKind, SOLE_INSTANCE};


fn sample_regions() -> Vec<Region> {
    vec![
        Region::new(10, 1, RegionKind::Header, SOLE_INSTANCE),
        Region::new(11, 1, RegionKind::Config, SOLE_INSTANCE),
        Region::new(12, 1000, RegionKind::Volume, 0),
        Region::new(1012, 14, RegionKind::Save, 2),
    ]
}
