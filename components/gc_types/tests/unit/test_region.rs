//! Unit tests for Region, RegionAge and SizeClass

use gc_types::{
    Address, GenerationId, Region, RegionAge, RegionId, SizeClass, GRANULE_SIZE, MAX_SURVIVOR_AGE,
};

fn medium_region() -> Region {
    Region::new(
        RegionId(10),
        SizeClass::Medium,
        Address(8 * GRANULE_SIZE),
        4 * GRANULE_SIZE,
        RegionAge::Survivor(1),
    )
}

#[cfg(test)]
mod region_age_tests {
    use super::*;

    #[test]
    fn test_eden_is_young() {
        assert!(RegionAge::Eden.is_young());
    }

    #[test]
    fn test_max_survivor_is_young() {
        assert!(RegionAge::Survivor(MAX_SURVIVOR_AGE).is_young());
    }

    #[test]
    fn test_old_is_not_young() {
        assert!(!RegionAge::Old.is_young());
        assert_eq!(RegionAge::Old.generation(), GenerationId::Old);
    }

    #[test]
    fn test_age_display() {
        assert_eq!(RegionAge::Eden.to_string(), "eden");
        assert_eq!(RegionAge::Survivor(4).to_string(), "survivor4");
        assert_eq!(RegionAge::Old.to_string(), "old");
    }
}

#[cfg(test)]
mod region_tests {
    use super::*;

    #[test]
    fn test_region_extent() {
        let region = medium_region();
        assert_eq!(region.start(), Address(8 * GRANULE_SIZE));
        assert_eq!(region.end(), Address(12 * GRANULE_SIZE));
        assert!(region.contains(Address(11 * GRANULE_SIZE)));
        assert!(!region.contains(region.end()));
    }

    #[test]
    fn test_region_size_class() {
        assert_eq!(medium_region().size_class(), SizeClass::Medium);
    }

    #[test]
    fn test_region_offset_of() {
        let region = medium_region();
        let obj = region.alloc_object(100).unwrap();
        let next = region.alloc_object(8).unwrap();
        assert_eq!(region.offset_of(obj), 0);
        assert_eq!(region.offset_of(next), 104);
    }

    #[test]
    #[should_panic(expected = "is not in region")]
    fn test_region_offset_of_outside_panics() {
        medium_region().offset_of(Address(GRANULE_SIZE));
    }

    #[test]
    fn test_region_live_map_is_address_ordered() {
        let region = medium_region();
        let a = region.alloc_object(16).unwrap();
        let b = region.alloc_object(32).unwrap();
        let c = region.alloc_object(64).unwrap();
        region.mark_live(c, 64);
        region.mark_live(a, 16);

        let live: Vec<Address> = region.live_map().iter().map(|o| o.addr).collect();
        assert_eq!(live, vec![a, c]);
        assert!(!region.is_live(b));
    }

    #[test]
    fn test_region_object_size_lookup() {
        let region = medium_region();
        let a = region.alloc_object(20).unwrap();
        assert_eq!(region.object_size(a), Some(24));
        assert_eq!(region.object_size(a.offset(8)), None);
    }

    #[test]
    fn test_region_display_id() {
        assert_eq!(RegionId(7).to_string(), "R7");
    }
}
