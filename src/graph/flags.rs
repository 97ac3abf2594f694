//! Node flags.
//!
//! Every node carries at most one flag of each [`FlagKind`], stored in a
//! fixed-size array indexed by the kind. No allocation for the flag set.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{DescriptorError, RetryOpt, TxnOperation, ValueRef, ValueState, values_equal};

/// Number of flag kinds.
pub const MAX_FLAGS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlagKind {
    LastUpdate = 0,
    ValueState = 1,
    Error = 2,
    Descriptor = 3,
    Derived = 4,
    Unavailable = 5,
}

impl FlagKind {
    pub fn name(self) -> &'static str {
        match self {
            FlagKind::LastUpdate => "last-update",
            FlagKind::ValueState => "value-state",
            FlagKind::Error => "error",
            FlagKind::Descriptor => "descriptor",
            FlagKind::Derived => "derived",
            FlagKind::Unavailable => "unavailable",
        }
    }
}

/// Last NB/SB/retry update of a value.
#[derive(Debug, Clone)]
pub struct LastUpdate {
    pub txn_seq_num: u64,
    pub txn_op: TxnOperation,
    /// Last requested value (`None` = removal).
    pub value: Option<ValueRef>,
    pub revert: bool,
    pub retry: Option<RetryOpt>,
}

#[derive(Debug, Clone)]
pub enum Flag {
    LastUpdate(LastUpdate),
    ValueState(ValueState),
    Error { err: DescriptorError, retriable: bool },
    /// Name of the descriptor owning the value.
    Descriptor(String),
    /// Key of the base value this value is derived from.
    Derived(String),
    /// Value is not present in the SB.
    Unavailable,
}

impl Flag {
    pub fn kind(&self) -> FlagKind {
        match self {
            Flag::LastUpdate(_) => FlagKind::LastUpdate,
            Flag::ValueState(_) => FlagKind::ValueState,
            Flag::Error { .. } => FlagKind::Error,
            Flag::Descriptor(_) => FlagKind::Descriptor,
            Flag::Derived(_) => FlagKind::Derived,
            Flag::Unavailable => FlagKind::Unavailable,
        }
    }

    /// Same kind and same content.
    pub fn same_as(&self, other: &Flag) -> bool {
        match (self, other) {
            (Flag::LastUpdate(a), Flag::LastUpdate(b)) => {
                a.txn_seq_num == b.txn_seq_num
                    && a.txn_op == b.txn_op
                    && a.revert == b.revert
                    && a.retry == b.retry
                    && values_equal(a.value.as_ref(), b.value.as_ref())
            }
            (Flag::ValueState(a), Flag::ValueState(b)) => a == b,
            (Flag::Error { err: a, retriable: ra }, Flag::Error { err: b, retriable: rb }) => a == b && ra == rb,
            (Flag::Descriptor(a), Flag::Descriptor(b)) | (Flag::Derived(a), Flag::Derived(b)) => a == b,
            (Flag::Unavailable, Flag::Unavailable) => true,
            _ => false,
        }
    }

    /// Flag value as used by selectors and statistics.
    pub fn value(&self) -> String {
        match self {
            Flag::LastUpdate(lu) => format!("{} ({})", lu.txn_op, lu.txn_seq_num),
            Flag::ValueState(state) => state.to_string(),
            Flag::Error { err, .. } => err.to_string(),
            Flag::Descriptor(name) => name.clone(),
            Flag::Derived(base) => base.clone(),
            Flag::Unavailable => String::new(),
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.value();
        if value.is_empty() {
            write!(f, "{}", self.kind().name())
        } else {
            write!(f, "{}: {}", self.kind().name(), value)
        }
    }
}

/// Fixed-size flag set.
#[derive(Debug, Clone, Default)]
pub struct Flags([Option<Flag>; MAX_FLAGS]);

impl Flags {
    pub fn get(&self, kind: FlagKind) -> Option<&Flag> {
        self.0[kind as usize].as_ref()
    }

    pub fn has(&self, kind: FlagKind) -> bool {
        self.0[kind as usize].is_some()
    }

    /// Returns false if an identical flag was already set.
    pub fn set(&mut self, flag: Flag) -> bool {
        let slot = &mut self.0[flag.kind() as usize];
        if slot.as_ref().is_some_and(|old| old.same_as(&flag)) {
            return false;
        }
        *slot = Some(flag);
        true
    }

    /// Returns true if the flag was present.
    pub fn del(&mut self, kind: FlagKind) -> bool {
        self.0[kind as usize].take().is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Flag> {
        self.0.iter().flatten()
    }

    // Typed accessors.

    pub fn last_update(&self) -> Option<&LastUpdate> {
        match self.get(FlagKind::LastUpdate) {
            Some(Flag::LastUpdate(lu)) => Some(lu),
            _ => None,
        }
    }

    pub fn value_state(&self) -> ValueState {
        match self.get(FlagKind::ValueState) {
            Some(Flag::ValueState(state)) => *state,
            _ => ValueState::Nonexistent,
        }
    }

    pub fn error(&self) -> Option<(&DescriptorError, bool)> {
        match self.get(FlagKind::Error) {
            Some(Flag::Error { err, retriable }) => Some((err, *retriable)),
            _ => None,
        }
    }

    pub fn descriptor(&self) -> Option<&str> {
        match self.get(FlagKind::Descriptor) {
            Some(Flag::Descriptor(name)) => Some(name),
            _ => None,
        }
    }

    pub fn derived_from(&self) -> Option<&str> {
        match self.get(FlagKind::Derived) {
            Some(Flag::Derived(base)) => Some(base),
            _ => None,
        }
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.iter().map(|flag| flag.to_string()).collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

// ============================================================================
// Selectors
// ============================================================================

/// Node filter over flags.
///
/// A selector flag with an empty value (e.g. `Flag::Descriptor(String::new())`)
/// matches any value of that kind.
#[derive(Debug, Clone)]
pub enum FlagSelector {
    /// Node must have all of the flags.
    With(Vec<Flag>),
    /// Node must have none of the flags.
    Without(Vec<Flag>),
}

impl FlagSelector {
    pub fn with(flags: impl IntoIterator<Item = Flag>) -> Self {
        FlagSelector::With(flags.into_iter().collect())
    }

    pub fn without(flags: impl IntoIterator<Item = Flag>) -> Self {
        FlagSelector::Without(flags.into_iter().collect())
    }

    pub fn matches(&self, flags: &Flags) -> bool {
        match self {
            FlagSelector::With(required) => required.iter().all(|sel| has_matching(flags, sel)),
            FlagSelector::Without(excluded) => !excluded.iter().any(|sel| has_matching(flags, sel)),
        }
    }
}

fn has_matching(flags: &Flags, sel: &Flag) -> bool {
    match flags.get(sel.kind()) {
        None => false,
        Some(flag) => {
            let wanted = sel.value();
            wanted.is_empty() || wanted == flag.value()
        }
    }
}
