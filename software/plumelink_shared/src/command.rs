//! Command sets: one decoded unit of the protocol.

use std::collections::BTreeMap;

use crate::role::RoleId;
use crate::schema::Code;
use crate::value::Value;

/// Ordered mapping from code to value.
///
/// The source identity lives under [`Code::IDN`] and the optional
/// destination list under [`Code::DST`]. Iteration follows wire order,
/// which puts `IDN` and `DST` first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandSet {
    entries: BTreeMap<Code, Value>,
}

impl CommandSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty set tagged with a source identity.
    pub fn from_role(role: RoleId) -> Self {
        let mut cmd = Self::new();
        cmd.set_source(role);
        cmd
    }

    /// Builder-style insert.
    pub fn with(mut self, code: Code, value: impl Into<Value>) -> Self {
        self.insert(code, value);
        self
    }

    pub fn insert(&mut self, code: Code, value: impl Into<Value>) -> Option<Value> {
        self.entries.insert(code, value.into())
    }

    pub fn get(&self, code: Code) -> Option<&Value> {
        self.entries.get(&code)
    }

    pub fn remove(&mut self, code: Code) -> Option<Value> {
        self.entries.remove(&code)
    }

    pub fn contains(&self, code: Code) -> bool {
        self.entries.contains_key(&code)
    }

    /// Whether `code` is present with a true value.
    pub fn is_set(&self, code: Code) -> bool {
        self.get(code).is_some_and(Value::as_bool)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Code, &Value)> {
        self.entries.iter().map(|(c, v)| (*c, v))
    }

    /// Codes present, in wire order.
    pub fn codes(&self) -> Vec<Code> {
        self.entries.keys().copied().collect()
    }

    /// Declared source, or [`RoleId::Unidentified`] when absent or unparseable.
    pub fn source(&self) -> RoleId {
        self.get(Code::IDN)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(RoleId::Unidentified)
    }

    pub fn has_source(&self) -> bool {
        self.contains(Code::IDN)
    }

    pub fn set_source(&mut self, role: RoleId) {
        self.insert(Code::IDN, role.tag());
    }

    /// Declared destinations, if the set is addressed.
    pub fn destination(&self) -> Option<Vec<RoleId>> {
        let items = self.get(Code::DST)?.as_list()?;
        Some(items.iter().filter_map(|s| s.parse().ok()).collect())
    }

    pub fn set_destination(&mut self, roles: &[RoleId]) {
        let tags = roles.iter().map(|r| r.tag().to_owned()).collect::<Vec<_>>();
        self.insert(Code::DST, tags);
    }

    /// Whether delivery to `role` is allowed by the destination field.
    pub fn is_addressed_to(&self, role: RoleId) -> bool {
        match self.destination() {
            Some(dst) => dst.contains(&role),
            None => true,
        }
    }

    /// Codes listed under `ERR`.
    pub fn errors(&self) -> Vec<Code> {
        self.get(Code::ERR)
            .and_then(Value::as_list)
            .map(|items| items.iter().filter_map(|s| s.parse().ok()).collect())
            .unwrap_or_default()
    }

    /// Copy every entry of `other` into this set, replacing existing keys.
    pub fn merge(&mut self, other: &CommandSet) {
        for (code, value) in other.iter() {
            self.entries.insert(code, value.clone());
        }
    }

    /// Whether the set carries nothing but routing fields.
    pub fn is_routing_only(&self) -> bool {
        self.entries
            .keys()
            .all(|c| matches!(c, Code::IDN | Code::DST))
    }

    /// Entry-wise equality with float tolerance of the wire format.
    pub fn approx_eq(&self, other: &CommandSet) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|(c, v)| other.get(c).is_some_and(|o| v.approx_eq(o)))
    }
}

impl FromIterator<(Code, Value)> for CommandSet {
    fn from_iter<T: IntoIterator<Item = (Code, Value)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl Extend<(Code, Value)> for CommandSet {
    fn extend<T: IntoIterator<Item = (Code, Value)>>(&mut self, iter: T) {
        self.entries.extend(iter);
    }
}
