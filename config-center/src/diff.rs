//! Structural diff between two flattened namespace documents.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::codec::{FlatMap, flatten};
use crate::error::ConfigError;
use crate::keys::Format;
use crate::message::{ChangeEvent, ChangeType};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringPair {
    pub before: String,
    pub after: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NamespaceDiff {
    pub namespace: String,
    pub same: bool,
    pub added: FlatMap,
    pub removed: FlatMap,
    pub changed: BTreeMap<String, StringPair>,
    pub unchanged: FlatMap,
}

impl NamespaceDiff {
    /// One event per added, changed and removed key.
    pub fn events(&self) -> Vec<ChangeEvent> {
        let event = |key: &String, kind, current: &str, before: &str| ChangeEvent {
            namespace: self.namespace.clone(),
            key: key.clone(),
            kind,
            current: current.to_string(),
            before: before.to_string(),
        };
        let added = self
            .added
            .iter()
            .map(|(key, value)| event(key, ChangeType::Add, value, ""));
        let changed = self
            .changed
            .iter()
            .map(|(key, pair)| event(key, ChangeType::Change, &pair.after, &pair.before));
        let removed = self
            .removed
            .iter()
            .map(|(key, value)| event(key, ChangeType::Remove, "", value));
        added.chain(changed).chain(removed).collect()
    }
}

/// Parses both contents with the format of `namespace` and diffs them.
pub fn diff(namespace: &str, old: &str, new: &str) -> Result<NamespaceDiff, ConfigError> {
    let format = Format::of(namespace)?;
    let old = flatten(format, old)?;
    let new = flatten(format, new)?;
    Ok(diff_maps(namespace, &old, &new))
}

/// Partitions the keys of `old` and `new`. Values are compared ignoring case.
///
/// An empty `new` yields `same` with every old key unchanged, so a missing
/// draft and a draft that flattens to nothing both read as "nothing to
/// release".
pub fn diff_maps(namespace: &str, old: &FlatMap, new: &FlatMap) -> NamespaceDiff {
    if new.is_empty() {
        return NamespaceDiff {
            namespace: namespace.to_string(),
            same: true,
            unchanged: old.clone(),
            ..NamespaceDiff::default()
        };
    }

    let mut out = NamespaceDiff {
        namespace: namespace.to_string(),
        ..NamespaceDiff::default()
    };
    for (key, before) in old {
        match new.get(key) {
            Some(after) if equal_ignore_case(before, after) => {
                out.unchanged.insert(key.clone(), before.clone());
            }
            Some(after) => {
                out.changed.insert(
                    key.clone(),
                    StringPair {
                        before: before.clone(),
                        after: after.clone(),
                    },
                );
            }
            None => {
                out.removed.insert(key.clone(), before.clone());
            }
        }
    }
    for (key, value) in new {
        if !old.contains_key(key) {
            out.added.insert(key.clone(), value.clone());
        }
    }
    out.same = out.added.is_empty() && out.removed.is_empty() && out.changed.is_empty();
    out
}

fn equal_ignore_case(a: &str, b: &str) -> bool {
    a == b || a.to_lowercase() == b.to_lowercase()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn map(pairs: &[(&str, &str)]) -> FlatMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn partitions_keys_four_ways() {
        let old = map(&[("a", "1"), ("b", "2"), ("c", "Yes")]);
        let new = map(&[("a", "1"), ("b", "3"), ("c", "yes"), ("d", "4")]);
        let d = diff_maps("app.props", &old, &new);
        assert!(!d.same);
        assert_eq!(d.added, map(&[("d", "4")]));
        assert!(d.removed.is_empty());
        assert_eq!(d.unchanged, map(&[("a", "1"), ("c", "Yes")]));
        assert_eq!(
            d.changed["b"],
            StringPair {
                before: "2".into(),
                after: "3".into()
            }
        );
    }

    #[test]
    fn empty_new_side_reads_as_same() {
        let old = map(&[("a", "1"), ("b", "2")]);
        let d = diff_maps("app.props", &old, &FlatMap::new());
        assert!(d.same);
        assert_eq!(d.unchanged, old);
        assert!(d.added.is_empty() && d.removed.is_empty() && d.changed.is_empty());
    }

    #[test]
    fn first_release_of_props_adds_every_key() -> anyhow::Result<()> {
        let d = diff("app.props", "", "a=1\nb=2")?;
        assert_eq!(d.added, map(&[("a", "1"), ("b", "2")]));

        let events = d.events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind == ChangeType::Add && e.namespace == "app.props"));
        Ok(())
    }

    #[test]
    fn events_carry_before_and_after_values() -> anyhow::Result<()> {
        let d = diff("db.yaml", "host: a\nport: 1\n", "host: b\nuser: u\n")?;
        let events = d.events();
        let kinds: Vec<(ChangeType, &str, &str, &str)> = events
            .iter()
            .map(|e| (e.kind, e.key.as_str(), e.current.as_str(), e.before.as_str()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (ChangeType::Add, "user", "u", ""),
                (ChangeType::Change, "host", "b", "a"),
                (ChangeType::Remove, "port", "", "1"),
            ]
        );
        Ok(())
    }

    #[test]
    fn diff_wire_shape_is_camel_case() -> anyhow::Result<()> {
        let d = diff("app.json", r#"{"a":1}"#, r#"{"a":2}"#)?;
        let json = serde_json::to_value(&d)?;
        assert_eq!(json["namespace"], "app.json");
        assert_eq!(json["changed"]["a"]["before"], "1");
        assert_eq!(serde_json::from_value::<NamespaceDiff>(json)?, d);
        Ok(())
    }

    fn flat_maps() -> impl Strategy<Value = FlatMap> {
        prop::collection::btree_map("[a-e]{1,2}", "[a-cA-C0-2]{0,2}", 1..8)
    }

    proptest! {
        #[test]
        fn diff_is_symmetric(a in flat_maps(), b in flat_maps()) {
            let forward = diff_maps("n.props", &a, &b);
            let backward = diff_maps("n.props", &b, &a);
            prop_assert_eq!(&forward.added, &backward.removed);
            prop_assert_eq!(&forward.removed, &backward.added);
            prop_assert_eq!(forward.changed.len(), backward.changed.len());
            for (key, pair) in &forward.changed {
                let mirrored = &backward.changed[key];
                prop_assert_eq!(&pair.before, &mirrored.after);
                prop_assert_eq!(&pair.after, &mirrored.before);
            }
        }

        #[test]
        fn diff_against_itself_is_same(a in flat_maps()) {
            let d = diff_maps("n.props", &a, &a);
            prop_assert!(d.same);
            prop_assert_eq!(d.unchanged, a);
        }
    }
}
