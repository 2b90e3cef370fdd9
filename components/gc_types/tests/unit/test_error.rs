//! Unit tests for GcError

use gc_types::{GcError, GcResult, GenerationId};

#[cfg(test)]
mod gc_error_tests {
    use super::*;

    #[test]
    fn test_invalid_config_message() {
        let err = GcError::InvalidConfig("young_workers must be at least 1".to_string());
        assert_eq!(
            err.to_string(),
            "invalid configuration: young_workers must be at least 1"
        );
    }

    #[test]
    fn test_cycle_in_progress_message() {
        let err = GcError::CycleInProgress(GenerationId::Young);
        assert_eq!(err.to_string(), "Young collection already in progress");
    }

    #[test]
    fn test_heap_exhausted_message() {
        let err = GcError::HeapExhausted { requested: 4096 };
        assert!(err.to_string().contains("4096"));
    }

    #[test]
    fn test_io_error_converts() {
        fn load() -> GcResult<()> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gc.json"))?;
            Ok(())
        }
        assert!(matches!(load(), Err(GcError::Io(_))));
    }
}
