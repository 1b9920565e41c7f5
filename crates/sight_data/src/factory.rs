//! Data factory
//!
//! Maps a type name to a constructor. Types are registered explicitly,
//! typically once at startup with `with_builtins()` plus the application's
//! own payloads.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;

use crate::{Boolean, Data, DataError, DataResult, Float, Integer, Matrix4, Object, ObjectRef, Text};

type DataCtor = Arc<dyn Fn(Option<&serde_json::Value>) -> DataResult<Box<dyn Data>> + Send + Sync>;

#[derive(Default)]
pub struct DataFactory {
    ctors: RwLock<HashMap<String, DataCtor>>,
}

impl DataFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory knowing the built-in payload types
    pub fn with_builtins() -> Self {
        let factory = Self::new();
        factory.register_default::<Boolean>("Boolean");
        factory.register_default::<Integer>("Integer");
        factory.register_default::<Float>("Float");
        factory.register_default::<Text>("Text");
        factory.register_default::<Matrix4>("Matrix4");
        factory
    }

    /// Register a constructor under a type name
    pub fn register<F>(&self, type_name: impl Into<String>, ctor: F)
    where
        F: Fn(Option<&serde_json::Value>) -> DataResult<Box<dyn Data>> + Send + Sync + 'static,
    {
        let type_name = type_name.into();
        tracing::debug!(data_type = %type_name, "Registered data type");
        self.ctors.write().insert(type_name, Arc::new(ctor));
    }

    /// Register a type built from `Default` or deserialized from the value
    pub fn register_default<T>(&self, type_name: &str)
    where
        T: Data + Default + DeserializeOwned,
    {
        let name = type_name.to_string();
        self.register(type_name, move |value| match value {
            None => Ok(Box::new(T::default()) as Box<dyn Data>),
            Some(value) => serde_json::from_value::<T>(value.clone())
                .map(|data| Box::new(data) as Box<dyn Data>)
                .map_err(|e| DataError::InvalidValue {
                    type_name: name.clone(),
                    reason: e.to_string(),
                }),
        });
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.ctors.read().contains_key(type_name)
    }

    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.ctors.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Create an object of the given type
    pub fn create(
        &self,
        type_name: &str,
        uid: impl Into<String>,
        value: Option<&serde_json::Value>,
    ) -> DataResult<ObjectRef> {
        let ctor = self
            .ctors
            .read()
            .get(type_name)
            .cloned()
            .ok_or_else(|| DataError::UnknownType(type_name.to_string()))?;

        let data = ctor(value)?;
        Ok(Object::from_boxed(uid, data))
    }
}

impl std::fmt::Debug for DataFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFactory").field("types", &self.types()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_builtins() {
        let factory = DataFactory::with_builtins();

        let count = factory.create("Integer", "count", Some(&json!(3))).unwrap();
        assert_eq!(count.uid(), "count");
        assert_eq!(count.class(), "Integer");
        assert_eq!(*count.read::<Integer>().unwrap(), Integer(3));

        let matrix = factory.create("Matrix4", "matrix", None).unwrap();
        assert_eq!(*matrix.read::<Matrix4>().unwrap(), Matrix4::identity());
    }

    #[test]
    fn test_unknown_type_and_bad_value() {
        let factory = DataFactory::with_builtins();

        assert_eq!(
            factory.create("Image", "img", None).err(),
            Some(DataError::UnknownType("Image".into()))
        );
        assert!(matches!(
            factory.create("Integer", "count", Some(&json!("three"))),
            Err(DataError::InvalidValue { .. })
        ));
    }
}
