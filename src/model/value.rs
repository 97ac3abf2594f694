//! Opaque value payloads carried through the scheduler.
//!
//! The scheduler never looks inside a value. It only clones the handle,
//! compares two values (through the descriptor's comparator, which falls
//! back to [`Value::equals`]) and prints them for transaction summaries.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Any type usable as a key-value payload.
///
/// Blanket-implemented for every `Debug + PartialEq + Send + Sync + 'static`
/// type, so descriptors can simply use their own structs.
pub trait Value: Any + fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    /// Same type and `PartialEq`-equal.
    fn equals(&self, other: &dyn Value) -> bool;

    /// Name of the concrete type (for logs and type-mismatch errors).
    fn type_name(&self) -> &'static str;
}

impl<T> Value for T
where
    T: Any + fmt::Debug + PartialEq + Send + Sync,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn equals(&self, other: &dyn Value) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| other == self)
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

impl<'a> dyn Value + 'a {
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

/// Shared, immutable handle to a value.
pub type ValueRef = Arc<dyn Value>;

/// Descriptor-private runtime data attached to a base value.
///
/// Shares the representation of values; the engine stores it verbatim and
/// hands it back to the owning descriptor and its metadata map.
pub type Metadata = Arc<dyn Value>;

/// Wrap a concrete payload into a [`ValueRef`].
pub fn value<T: Value>(v: T) -> ValueRef {
    Arc::new(v)
}

/// Compare two optional values with [`Value::equals`].
pub fn values_equal(a: Option<&ValueRef>, b: Option<&ValueRef>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b) || a.equals(b.as_ref()),
        _ => false,
    }
}

/// Render an optional value for summaries.
pub(crate) fn display_value(v: Option<&ValueRef>) -> String {
    match v {
        Some(v) => format!("{v:?}"),
        None => "<NIL>".to_string(),
    }
}
