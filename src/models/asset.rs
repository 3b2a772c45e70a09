//! Local media references and the bounded pre-upload selection.

use crate::errors::UploadError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of assets a user may pick for one batch.
pub const MAX_SELECTION: usize = 3;

/// Reference to a media asset on the device (a local URI or file path).
///
/// The reference is opaque to the queue; only the configured
/// [`AssetResolver`](crate::services::asset_resolver::AssetResolver) knows how
/// to turn it into bytes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct AssetRef(String);

impl AssetRef {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AssetRef {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for AssetRef {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Assets chosen by the user before confirming an upload.
///
/// Holds at most [`MAX_SELECTION`] entries. Rejected additions leave the set
/// untouched.
#[derive(Debug, Default, Clone)]
pub struct SelectionSet {
    assets: Vec<AssetRef>,
}

impl SelectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an asset to the selection.
    ///
    /// Re-adding an asset that is already selected is a no-op.
    pub fn add(&mut self, asset: AssetRef) -> Result<(), UploadError> {
        if self.assets.contains(&asset) {
            return Ok(());
        }
        if self.assets.len() >= MAX_SELECTION {
            return Err(UploadError::SelectionLimitExceeded {
                limit: MAX_SELECTION,
            });
        }
        self.assets.push(asset);
        Ok(())
    }

    /// Remove an asset; returns whether it was selected.
    pub fn remove(&mut self, asset: &AssetRef) -> bool {
        let before = self.assets.len();
        self.assets.retain(|a| a != asset);
        before != self.assets.len()
    }

    pub fn contains(&self, asset: &AssetRef) -> bool {
        self.assets.contains(asset)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.assets.len() >= MAX_SELECTION
    }

    pub fn assets(&self) -> &[AssetRef] {
        &self.assets
    }

    pub fn clear(&mut self) {
        self.assets.clear();
    }

    /// Hand the selection off, leaving the set empty.
    pub fn take(&mut self) -> Vec<AssetRef> {
        std::mem::take(&mut self.assets)
    }
}

impl TryFrom<Vec<AssetRef>> for SelectionSet {
    type Error = UploadError;

    fn try_from(assets: Vec<AssetRef>) -> Result<Self, Self::Error> {
        let mut selection = SelectionSet::new();
        for asset in assets {
            selection.add(asset)?;
        }
        Ok(selection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourth_asset_is_rejected_and_selection_unchanged() {
        let mut selection = SelectionSet::new();
        for name in ["a.jpg", "b.jpg", "c.jpg"] {
            selection.add(AssetRef::from(name)).unwrap();
        }
        assert!(selection.is_full());

        let err = selection.add(AssetRef::from("d.jpg")).unwrap_err();
        assert!(matches!(
            err,
            UploadError::SelectionLimitExceeded { limit: MAX_SELECTION }
        ));
        assert_eq!(selection.len(), 3);
        assert!(!selection.contains(&AssetRef::from("d.jpg")));
    }

    #[test]
    fn duplicate_add_does_not_consume_a_slot() {
        let mut selection = SelectionSet::new();
        selection.add("a.jpg".into()).unwrap();
        selection.add("a.jpg".into()).unwrap();
        assert_eq!(selection.len(), 1);
    }

    #[test]
    fn take_clears_the_selection() {
        let mut selection = SelectionSet::new();
        selection.add("a.jpg".into()).unwrap();
        selection.add("b.jpg".into()).unwrap();

        let taken = selection.take();
        assert_eq!(taken, vec![AssetRef::from("a.jpg"), AssetRef::from("b.jpg")]);
        assert!(selection.is_empty());
    }

    #[test]
    fn remove_frees_a_slot() {
        let mut selection: SelectionSet =
            vec!["a".into(), "b".into(), "c".into()].try_into().unwrap();
        assert!(selection.remove(&"b".into()));
        assert!(!selection.remove(&"b".into()));
        selection.add("d".into()).unwrap();
        assert_eq!(selection.len(), 3);
    }

    #[test]
    fn try_from_rejects_oversized_lists() {
        let assets: Vec<AssetRef> = ["a", "b", "c", "d"].into_iter().map(Into::into).collect();
        assert!(SelectionSet::try_from(assets).is_err());
    }
}
