//! Exported properties.
//!
//! A property holds its current value (or nothing, when a live getter backs
//! it), its access mode and how changes are announced. Reads follow a
//! poll-on-read policy: properties that never announce changes, and
//! properties with nothing cached, are read through the getter.

use buslink_types::introspect::{Access, ChangeMode, PropertyInfo};
use buslink_types::{BusError, BusResult, BusType, Signature, Value};
use std::sync::{Arc, RwLock};

type Getter = Arc<dyn Fn() -> BusResult<Value> + Send + Sync>;
type Validator = Arc<dyn Fn(&Value) -> BusResult<()> + Send + Sync>;

/// One exported property.
pub struct Property {
    name: String,
    signature: Signature,
    access: Access,
    mode: ChangeMode,
    deprecated: bool,
    hidden: bool,
    value: RwLock<Option<Value>>,
    getter: Option<Getter>,
    validator: Option<Validator>,
}

impl Property {
    /// A read-write property holding `initial`, announcing new values.
    pub fn new<T: BusType>(name: &str, initial: T) -> Self {
        Self::declare(name, T::signature(), Some(initial.into_value()))
    }

    /// A read-only property whose value comes from `getter` on every read.
    pub fn computed<T, F>(name: &str, getter: F) -> Self
    where
        T: BusType,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let mut prop = Self::declare(name, T::signature(), None);
        prop.access = Access::Read;
        prop.mode = ChangeMode::None;
        prop.getter = Some(Arc::new(move || -> BusResult<Value> {
            Ok(getter().into_value())
        }));
        prop
    }

    /// A property with an explicit signature and optional initial value.
    pub fn declare(name: &str, signature: Signature, initial: Option<Value>) -> Self {
        Self {
            name: name.to_string(),
            signature,
            access: Access::ReadWrite,
            mode: ChangeMode::Emits,
            deprecated: false,
            hidden: false,
            value: RwLock::new(initial),
            getter: None,
            validator: None,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.access = Access::Read;
        self
    }

    pub fn write_only(mut self) -> Self {
        self.access = Access::Write;
        self
    }

    pub fn change_mode(mut self, mode: ChangeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn deprecated(mut self) -> Self {
        self.deprecated = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    /// Fallback getter used when nothing is cached (or always, for
    /// properties that do not announce changes).
    pub fn getter<F>(mut self, getter: F) -> Self
    where
        F: Fn() -> BusResult<Value> + Send + Sync + 'static,
    {
        self.getter = Some(Arc::new(getter));
        self
    }

    /// Check run on every remote write before the value is stored.
    pub fn validate<F>(mut self, check: F) -> Self
    where
        F: Fn(&Value) -> BusResult<()> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(check));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn rename(&mut self, name: String) {
        self.name = name;
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn mode(&self) -> ChangeMode {
        self.mode
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    /// Current value.
    pub fn read(&self) -> BusResult<Value> {
        let cached = self
            .value
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match (cached, &self.getter) {
            (Some(_), Some(getter)) if self.mode.polls() => getter()?.coerce(&self.signature),
            (Some(value), _) => Ok(value),
            (None, Some(getter)) => {
                let value = getter()?.coerce(&self.signature)?;
                if !self.mode.polls() {
                    *self.value.write().unwrap_or_else(|e| e.into_inner()) = Some(value.clone());
                }
                Ok(value)
            }
            (None, None) => Err(BusError::NotFound(format!(
                "property '{}' has no value",
                self.name
            ))),
        }
    }

    /// Check a remote write without storing it.
    pub(crate) fn check_remote_write(&self, value: Value) -> BusResult<Value> {
        if !self.access.writable() || self.mode == ChangeMode::Const {
            return Err(BusError::Permission(format!(
                "property '{}' is read-only",
                self.name
            )));
        }
        let value = value.unboxed().coerce(&self.signature)?;
        if let Some(check) = &self.validator {
            check(&value)?;
        }
        Ok(value)
    }

    /// Check an owner-side write: access flags do not apply, constness does.
    pub(crate) fn check_update(&self, value: Value) -> BusResult<Value> {
        if self.mode == ChangeMode::Const {
            return Err(BusError::Permission(format!(
                "property '{}' is constant",
                self.name
            )));
        }
        value.unboxed().coerce(&self.signature)
    }

    /// Replace the stored value. Returns false when it did not change.
    pub(crate) fn store(&self, value: Value) -> bool {
        let mut slot = self.value.write().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref() == Some(&value) {
            return false;
        }
        *slot = Some(value);
        true
    }

    /// Introspection entry.
    pub fn info(&self) -> PropertyInfo {
        PropertyInfo {
            name: self.name.clone(),
            signature: self.signature.to_string(),
            access: self.access,
            emits_changed: self.mode,
            deprecated: self.deprecated,
        }
    }
}

impl std::fmt::Debug for Property {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Property")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .field("access", &self.access)
            .field("mode", &self.mode)
            .finish()
    }
}
