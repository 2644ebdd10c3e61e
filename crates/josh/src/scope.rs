//! Scopes and the memoized dotted-path resolver.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::converter::Converter;
use crate::entity::EntityHandle;
use crate::error::{JoshError, JoshResult, ResolutionError};
use crate::value::EngineValue;

/// A name-keyed mapping an [`EngineValue`] can be resolved against, with an
/// ambient unit converter.
pub trait Scope {
    fn get(&self, name: &str) -> JoshResult<EngineValue>;
    fn has(&self, name: &str) -> bool;
    fn attributes(&self) -> Vec<String>;
    fn converter(&self) -> Rc<Converter>;
}

/// Wraps a parent scope with local bindings that shadow it for the remainder
/// of the handler invocation and are dropped on return.
pub struct LocalScope {
    parent: Rc<dyn Scope>,
    locals: RefCell<IndexMap<String, EngineValue>>,
}

impl LocalScope {
    pub fn new(parent: Rc<dyn Scope>) -> Self {
        Self {
            parent,
            locals: RefCell::new(IndexMap::new()),
        }
    }

    /// Binds `name` in this scope's locals, shadowing the parent.
    pub fn define_constant(&self, name: impl Into<String>, value: EngineValue) {
        self.locals.borrow_mut().insert(name.into(), value);
    }
}

impl Scope for LocalScope {
    fn get(&self, name: &str) -> JoshResult<EngineValue> {
        if let Some(value) = self.locals.borrow().get(name) {
            return Ok(value.clone());
        }
        self.parent.get(name)
    }

    fn has(&self, name: &str) -> bool {
        self.locals.borrow().contains_key(name) || self.parent.has(name)
    }

    fn attributes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.locals.borrow().keys().cloned().collect();
        names.extend(self.parent.attributes());
        names
    }

    fn converter(&self) -> Rc<Converter> {
        self.parent.converter()
    }
}

/// Exposes one entity's attributes as a scope.
pub struct EntityScope {
    entity: EntityHandle,
    converter: Rc<Converter>,
}

impl EntityScope {
    pub fn new(entity: EntityHandle, converter: Rc<Converter>) -> Self {
        Self { entity, converter }
    }
}

impl Scope for EntityScope {
    fn get(&self, name: &str) -> JoshResult<EngineValue> {
        self.entity
            .borrow()
            .get_attribute(name)
            .cloned()
            .ok_or_else(|| {
                JoshError::Resolution(ResolutionError {
                    path: name.to_owned(),
                    available: self.attributes(),
                })
            })
    }

    fn has(&self, name: &str) -> bool {
        self.entity.borrow().get_attribute(name).is_some()
    }

    fn attributes(&self) -> Vec<String> {
        self.entity.borrow().attribute_names().map(str::to_owned).collect()
    }

    fn converter(&self) -> Rc<Converter> {
        self.converter.clone()
    }
}

struct Memo {
    found_path: String,
    inner: Option<Rc<ValueResolver>>,
}

/// Dotted-path lookup helper, memoized on first use against a scope.
///
/// Resolution tries the longest prefix first: for `p_1.p_2...p_n` it tries
/// `k = n, n-1, ..., 1` and takes the first `k` for which the scope `has` the
/// joined prefix. That split — the local hit plus an inner resolver for the
/// remaining suffix — is fixed for the lifetime of this resolver instance:
/// longest match wins, and the search breaks on the first hit.
pub struct ValueResolver {
    path: String,
    segments: Vec<String>,
    memo: RefCell<Option<Memo>>,
}

impl ValueResolver {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let segments = path.split('.').map(str::to_owned).collect();
        Self {
            path,
            segments,
            memo: RefCell::new(None),
        }
    }

    fn ensure_memo(&self, scope: &dyn Scope) -> JoshResult<()> {
        if self.memo.borrow().is_some() {
            return Ok(());
        }
        let n = self.segments.len();
        for k in (1..=n).rev() {
            let candidate = self.segments[..k].join(".");
            if scope.has(&candidate) {
                let inner = if k == n {
                    None
                } else {
                    Some(Rc::new(ValueResolver::new(self.segments[k..].join("."))))
                };
                *self.memo.borrow_mut() = Some(Memo {
                    found_path: candidate,
                    inner,
                });
                return Ok(());
            }
        }
        Err(JoshError::Resolution(ResolutionError {
            path: self.path.clone(),
            available: scope.attributes(),
        }))
    }

    /// Resolves this path against `scope`, reusing the memoized split on
    /// every call after the first.
    pub fn get(&self, scope: &dyn Scope) -> JoshResult<EngineValue> {
        self.ensure_memo(scope)?;
        let (found_path, inner) = {
            let memo = self.memo.borrow();
            let memo = memo.as_ref().expect("memo populated by ensure_memo");
            (memo.found_path.clone(), memo.inner.clone())
        };
        let value = scope.get(&found_path)?;
        match inner {
            Some(inner) => {
                let entity = value.as_entity()?;
                let entity_scope = EntityScope::new(entity, scope.converter());
                inner.get(&entity_scope)
            }
            None => Ok(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use crate::units::Units;
    use std::cell::Cell;
    use std::collections::HashMap;

    struct MapScope {
        values: HashMap<String, EngineValue>,
        converter: Rc<Converter>,
        has_calls: Cell<usize>,
    }

    impl Scope for MapScope {
        fn get(&self, name: &str) -> JoshResult<EngineValue> {
            self.values.get(name).cloned().ok_or_else(|| {
                JoshError::Resolution(ResolutionError {
                    path: name.to_owned(),
                    available: self.attributes(),
                })
            })
        }
        fn has(&self, name: &str) -> bool {
            self.has_calls.set(self.has_calls.get() + 1);
            self.values.contains_key(name)
        }
        fn attributes(&self) -> Vec<String> {
            self.values.keys().cloned().collect()
        }
        fn converter(&self) -> Rc<Converter> {
            self.converter.clone()
        }
    }

    fn entity_scope_for(name: &str, attr: &str, value: EngineValue) -> EntityHandle {
        use crate::entity::EntityPrototype;
        let proto = EntityPrototype::new("Patch", IndexMap::new());
        let entity = proto.build(name);
        entity.borrow_mut().set_attribute(attr, value);
        entity
    }

    #[test]
    fn resolver_memoizes_longest_local_match() {
        let converter = Rc::new(Converter::new());
        let here_entity = entity_scope_for("here", "moisture", EngineValue::scalar_double(0.5, Units::dimensionless()));
        let mut values = HashMap::new();
        values.insert(
            "here".to_owned(),
            crate::value::EngineValueFactory::new(false).build_entity(here_entity),
        );
        let scope = MapScope { values, converter, has_calls: Cell::new(0) };

        let resolver = ValueResolver::new("here.moisture");
        let result = resolver.get(&scope).unwrap();
        assert_eq!(result.as_double().unwrap(), 0.5);

        let calls_after_first = scope.has_calls.get();
        // second get must not re-scan "here.moisture" then "here" again via ensure_memo
        let result2 = resolver.get(&scope).unwrap();
        assert_eq!(result2.as_double().unwrap(), 0.5);
        assert_eq!(scope.has_calls.get(), calls_after_first, "memoized resolver must not re-scan prefixes");
    }

    #[test]
    fn resolver_fails_with_available_attributes() {
        let converter = Rc::new(Converter::new());
        let scope = MapScope { values: HashMap::new(), converter, has_calls: Cell::new(0) };
        let resolver = ValueResolver::new("missing");
        let err = resolver.get(&scope).unwrap_err();
        assert!(matches!(err, JoshError::Resolution(_)));
    }

    #[test]
    fn local_scope_shadows_parent() {
        let converter = Rc::new(Converter::new());
        let mut values = HashMap::new();
        values.insert("x".to_owned(), EngineValue::scalar_double(1.0, Units::dimensionless()));
        let parent: Rc<dyn Scope> = Rc::new(MapScope { values, converter, has_calls: Cell::new(0) });
        let local = LocalScope::new(parent);
        local.define_constant("x", EngineValue::scalar_double(99.0, Units::dimensionless()));
        assert_eq!(local.get("x").unwrap().as_double().unwrap(), 99.0);
    }
}
