use vigil_core::Value;

use crate::objects::{Emitter, ManagedObject, ObjectError, ObjectFactory};

pub const KIND: &str = "state-holder";
pub const OBJECT_NAME: &str = "MBeans:type=SimpleStandard";
pub const RESET: &str = "vigil.state.reset";
pub const ATTRIBUTE_CHANGE: &str = "vigil.attribute.change";

/// A text `State` attribute plus a read-only change counter.
#[derive(Debug, Clone)]
pub struct StateHolder {
    state: String,
    changes: i64,
}

impl StateHolder {
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            changes: 0,
        }
    }

    pub fn factory() -> ObjectFactory {
        Box::new(|| Box::new(StateHolder::default()))
    }
}

impl Default for StateHolder {
    fn default() -> Self {
        Self::new("initial state")
    }
}

impl ManagedObject for StateHolder {
    fn get_attribute(&self, attribute: &str) -> Result<Value, ObjectError> {
        match attribute {
            "State" => Ok(Value::Text(self.state.clone())),
            "NbChanges" => Ok(Value::Int(self.changes)),
            _ => Err(ObjectError::NoSuchAttribute(attribute.to_string())),
        }
    }

    fn set_attribute(
        &mut self,
        attribute: &str,
        value: Value,
        events: &Emitter<'_>,
    ) -> Result<(), ObjectError> {
        match attribute {
            "State" => {
                let state = match value {
                    Value::Text(state) => state,
                    other => {
                        return Err(ObjectError::InvalidValue {
                            attribute: attribute.to_string(),
                            reason: format!("expected text, got {}", other.type_name()),
                        });
                    }
                };
                let old = std::mem::replace(&mut self.state, state);
                self.changes += 1;
                events.emit(
                    ATTRIBUTE_CHANGE,
                    format!("State changed from '{old}'"),
                    Some(Value::Text(self.state.clone())),
                );
                Ok(())
            }
            "NbChanges" => Err(ObjectError::ReadOnly(attribute.to_string())),
            _ => Err(ObjectError::NoSuchAttribute(attribute.to_string())),
        }
    }

    fn invoke(
        &mut self,
        operation: &str,
        _args: Vec<Value>,
        events: &Emitter<'_>,
    ) -> Result<Value, ObjectError> {
        match operation {
            "reset" => {
                self.state = "initial state".to_string();
                self.changes = 0;
                events.emit(RESET, "state reset", None);
                Ok(Value::Null)
            }
            _ => Err(ObjectError::NoSuchOperation(operation.to_string())),
        }
    }
}
