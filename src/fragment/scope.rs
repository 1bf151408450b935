use std::collections::BTreeMap;

use chrono::NaiveDateTime;

use crate::types::RowValues;

use super::Fragment;

/// Something a template expression can resolve a name to.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    /// A plain value, bound as a statement parameter when referenced.
    Value(RowValues),
    /// A composed fragment, spliced in place when referenced.
    Fragment(Fragment),
}

macro_rules! impl_value_binding {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl From<$ty> for Binding {
                fn from(value: $ty) -> Self {
                    Binding::Value(RowValues::from(value))
                }
            }
        )+
    };
}

impl_value_binding!(
    i64,
    i32,
    i16,
    u32,
    f64,
    f32,
    bool,
    String,
    &String,
    &str,
    NaiveDateTime,
    serde_json::Value,
    Vec<u8>,
);

impl From<RowValues> for Binding {
    fn from(value: RowValues) -> Self {
        Binding::Value(value)
    }
}

impl<T: Into<RowValues>> From<Option<T>> for Binding {
    fn from(value: Option<T>) -> Self {
        Binding::Value(RowValues::from(value))
    }
}

impl From<Fragment> for Binding {
    fn from(fragment: Fragment) -> Self {
        Binding::Fragment(fragment)
    }
}

impl From<&Fragment> for Binding {
    fn from(fragment: &Fragment) -> Self {
        Binding::Fragment(fragment.clone())
    }
}

/// Explicit variable scope captured when a template is parsed.
///
/// Templates never look at the caller's locals on their own; every name an
/// expression uses must be present here (or supplied later as a compile-time
/// parameter). The [`scope!`](crate::scope) macro captures locals by name.
///
/// ```rust
/// use sql_block::prelude::*;
///
/// let name = "abc";
/// let age = 28;
/// let scope = Scope::new().with("name", name).with("age", age);
/// assert_eq!(scope, sql_block::scope!(name, age));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scope {
    vars: BTreeMap<String, Binding>,
}

impl Scope {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Binding>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Binding>) {
        self.vars.insert(name.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Binding> {
        self.vars.get(name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }
}

impl<K: Into<String>, V: Into<Binding>> FromIterator<(K, V)> for Scope {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut scope = Scope::new();
        for (name, value) in iter {
            scope.insert(name, value);
        }
        scope
    }
}

/// Name lookup used by the expression evaluator.
///
/// Compile-time parameters shadow the scope captured at parse time.
#[derive(Clone, Copy)]
pub(crate) struct Layered<'a> {
    pub(crate) overrides: Option<&'a Scope>,
    pub(crate) captured: &'a Scope,
}

impl<'a> Layered<'a> {
    pub(crate) fn captured(captured: &'a Scope) -> Self {
        Self {
            overrides: None,
            captured,
        }
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<&'a Binding> {
        self.overrides
            .and_then(|scope| scope.get(name))
            .or_else(|| self.captured.get(name))
    }
}

/// Build a [`Scope`] from local variables, capturing each by name.
///
/// `name` captures `name.clone()`; `name = expr` binds an arbitrary expression.
///
/// ```rust
/// use sql_block::scope;
///
/// let sn = 100;
/// let s = scope!(sn, no = 300);
/// assert_eq!(s.len(), 2);
/// ```
#[macro_export]
macro_rules! scope {
    (@value $name:ident) => {
        ::std::clone::Clone::clone(&$name)
    };
    (@value $name:ident, $value:expr) => {
        $value
    };
    () => {
        $crate::Scope::new()
    };
    ($($name:ident $(= $value:expr)?),+ $(,)?) => {{
        let mut scope = $crate::Scope::new();
        $(
            scope.insert(stringify!($name), $crate::scope!(@value $name $(, $value)?));
        )+
        scope
    }};
}
