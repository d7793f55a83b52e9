//! Exported signal declarations.

use crate::method::describe;
use buslink_types::introspect::{Direction, SignalInfo};
use buslink_types::{Args, Signature};

/// A signal an object may emit.
#[derive(Debug, Clone)]
pub struct Signal {
    name: String,
    signature: Signature,
    arg_names: Vec<String>,
    deprecated: bool,
    hidden: bool,
}

impl Signal {
    /// A signal whose payload is the argument tuple `A`.
    pub fn new<A: Args>(name: &str) -> Self {
        Self::with_signature(name, A::signature())
    }

    pub fn with_signature(name: &str, signature: Signature) -> Self {
        Self {
            name: name.to_string(),
            signature,
            arg_names: Vec::new(),
            deprecated: false,
            hidden: false,
        }
    }

    pub fn arg_names(mut self, names: &[&str]) -> Self {
        self.arg_names = names.iter().map(|n| n.to_string()).collect();
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

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn rename(&mut self, name: String) {
        self.name = name;
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    pub fn info(&self) -> SignalInfo {
        SignalInfo {
            name: self.name.clone(),
            args: describe(&self.signature, &self.arg_names, Direction::In),
            deprecated: self.deprecated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_info() {
        let s = Signal::new::<(String, u32)>("Progress").arg_names(&["stage", "percent"]);
        let info = s.info();
        assert_eq!(info.signature().unwrap().as_str(), "su");
        assert_eq!(info.args[1].name.as_deref(), Some("percent"));
    }
}
