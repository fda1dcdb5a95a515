use crate::{DelegateError, Result};

/// Backend argument IDs with a lazily sorted positional view.
///
/// IDs are registered in whatever order the compiler discovers them. The
/// first positional lookup after any registration sorts the list
/// ascending; later lookups are served from the sorted view until the next
/// registration marks it stale again. Duplicates are not checked.
#[derive(Debug, Clone, Default)]
pub struct ArgumentIds {
    ids: Vec<u32>,
    dirty: bool,
}

impl ArgumentIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: u32) {
        self.ids.push(id);
        self.dirty = true;
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// The `index`-th smallest registered ID.
    pub fn get(&mut self, index: usize) -> Result<u32> {
        if self.dirty {
            self.ids.sort_unstable();
            self.dirty = false;
        }
        self.ids
            .get(index)
            .copied()
            .ok_or(DelegateError::OutOfRange { index, len: self.ids.len() })
    }

    /// All IDs in ascending order.
    pub fn sorted(&mut self) -> &[u32] {
        if self.dirty {
            self.ids.sort_unstable();
            self.dirty = false;
        }
        &self.ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sorted_on_access() {
        let mut ids = ArgumentIds::new();
        for id in [7, 3, 5] {
            ids.register(id);
        }
        assert_eq!(ids.len(), 3);
        assert_eq!(ids.get(0).unwrap(), 3);
        assert_eq!(ids.get(1).unwrap(), 5);
        assert_eq!(ids.get(2).unwrap(), 7);
    }

    #[test]
    fn test_out_of_range() {
        let mut ids = ArgumentIds::new();
        ids.register(1);
        assert_eq!(ids.get(1).unwrap_err(), DelegateError::OutOfRange { index: 1, len: 1 });
        assert!(matches!(ArgumentIds::new().get(0), Err(DelegateError::OutOfRange { .. })));
    }

    #[test]
    fn test_registration_after_read_invalidates_view() {
        let mut ids = ArgumentIds::new();
        ids.register(10);
        ids.register(4);
        assert_eq!(ids.get(0).unwrap(), 4);
        ids.register(1);
        assert_eq!(ids.get(0).unwrap(), 1);
        assert_eq!(ids.sorted(), &[1, 4, 10]);
    }

    #[test]
    fn test_duplicates_kept() {
        let mut ids = ArgumentIds::new();
        ids.register(2);
        ids.register(2);
        assert_eq!(ids.len(), 2);
        assert_eq!(ids.sorted(), &[2, 2]);
    }
}
