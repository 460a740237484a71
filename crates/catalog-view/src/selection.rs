use std::collections::HashSet;

use catalog_sdk::{Item, ItemId};

/// Selected item identifiers. Membership is by identity, so a selection
/// survives re-sorting, refetches and items scrolling out of the loaded range.
#[derive(Debug, Clone, Default)]
pub struct SelectionRegistry {
    selected: HashSet<ItemId>,
}

impl SelectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flips membership of `id`. Returns whether it is selected afterwards.
    pub fn toggle(&mut self, id: &ItemId) -> bool {
        if self.selected.remove(id) {
            false
        } else {
            self.selected.insert(id.clone());
            true
        }
    }

    /// Adds every id; already-selected ids are left alone.
    pub fn select_visible<'a, I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = &'a ItemId>,
    {
        self.selected.extend(ids.into_iter().cloned());
    }

    pub fn clear(&mut self) {
        self.selected.clear();
    }

    pub fn has(&self, id: &ItemId) -> bool {
        self.selected.contains(id)
    }

    pub fn size(&self) -> usize {
        self.selected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ItemId> {
        self.selected.iter()
    }

    /// Selected items in the order they appear in `items`. Ids that are not
    /// present in `items` are skipped.
    pub fn ordered_in<'a>(&self, items: &'a [Item]) -> Vec<&'a Item> {
        items.iter().filter(|item| self.has(&item.id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn toggle_flips_membership() {
        let mut selection = SelectionRegistry::new();
        let id = ItemId::from("a");
        assert!(selection.toggle(&id));
        assert!(selection.has(&id));
        assert!(!selection.toggle(&id));
        assert!(!selection.has(&id));
        assert!(selection.is_empty());
    }

    #[test]
    fn select_visible_unions_and_tolerates_unknown_ids() {
        let mut selection = SelectionRegistry::new();
        let a = ItemId::from("a");
        let ghost = ItemId::from("ghost");
        selection.toggle(&a);
        selection.select_visible([&a, &ItemId::from("b"), &ghost]);
        assert_eq!(selection.size(), 3);

        let items = vec![Item::new("b", "Bee"), Item::new("c", "Sea"), Item::new("a", "Ay")];
        let ordered: Vec<_> = selection
            .ordered_in(&items)
            .into_iter()
            .map(|item| item.id.as_str())
            .collect();
        assert_eq!(ordered, ["b", "a"]);

        selection.clear();
        assert_eq!(selection.size(), 0);
    }

    proptest! {
        #[test]
        fn double_toggle_is_identity(
            initial in proptest::collection::hash_set("[a-e]{1,2}", 0..10),
            target in "[a-e]{1,2}",
        ) {
            let mut selection = SelectionRegistry::new();
            let initial: Vec<ItemId> = initial.into_iter().map(ItemId::from).collect();
            selection.select_visible(initial.iter());
            let before: HashSet<ItemId> = selection.ids().cloned().collect();

            let target = ItemId::from(target);
            selection.toggle(&target);
            selection.toggle(&target);

            let after: HashSet<ItemId> = selection.ids().cloned().collect();
            prop_assert_eq!(before, after);
        }
    }
}
