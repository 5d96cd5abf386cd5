//! Ownership checks for callers sitting above the widget store.

use crate::error::CoreError;

/// Fail with [`CoreError::Forbidden`] unless `owner_id` owns the entity.
pub fn ensure_owner(entity_owner: &str, owner_id: &str) -> Result<(), CoreError> {
    if entity_owner == owner_id {
        Ok(())
    } else {
        Err(CoreError::Forbidden(
            "Widget belongs to a different owner".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_owner_passes() {
        assert!(ensure_owner("u1", "u1").is_ok());
    }

    #[test]
    fn other_owner_is_forbidden() {
        assert!(matches!(ensure_owner("u1", "u2"), Err(CoreError::Forbidden(_))));
    }
}
