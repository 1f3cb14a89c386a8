//! Archive records for input wrappers
//!
//! An input wrapper is saved as the id of its upstream proxy plus the scribe
//! id of the subject token it watches. Loading resolves the proxy id through
//! a caller-supplied lookup. A token id that is not in the current mapping
//! table of the proxy type loads as [`ScribeLoad::UnknownType`] instead of
//! being guessed.

use crate::error::ScribeError;
use crate::layer_proxy::input::{InputLayerProxy, InputLayerProxySequence, OptionalInputLayerProxy};
use crate::layer_proxy::{InputLayer, SubjectTokenSelector};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tecton_types::LayerProxyId;

/// Bumped whenever a record layout or a scribe id changes meaning.
pub const SCRIBE_VERSION: u32 = 1;

/// The outcome of loading a record whose token id may be unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScribeLoad<T> {
    Loaded(T),
    /// Written by a newer mapping table; the field must not be restored.
    UnknownType { id: String },
}

impl<T> ScribeLoad<T> {
    pub fn loaded(self) -> Option<T> {
        match self {
            ScribeLoad::Loaded(value) => Some(value),
            ScribeLoad::UnknownType { .. } => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ScribeLoad<U> {
        match self {
            ScribeLoad::Loaded(value) => ScribeLoad::Loaded(f(value)),
            ScribeLoad::UnknownType { id } => ScribeLoad::UnknownType { id },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputLayerProxyRecord {
    pub layer: LayerProxyId,
    pub subject_token: String,
}

impl InputLayerProxyRecord {
    pub fn save<P: InputLayer>(input: &InputLayerProxy<P>) -> Self {
        InputLayerProxyRecord {
            layer: input.input_layer_proxy().layer_proxy_id(),
            subject_token: input.selector().scribe_id().to_string(),
        }
    }

    /// The loaded input is stale until its owner next acknowledges it.
    pub fn load<P: InputLayer>(
        &self,
        lookup: impl Fn(LayerProxyId) -> Option<Arc<P>>,
    ) -> Result<ScribeLoad<InputLayerProxy<P>>, ScribeError> {
        Ok(self
            .resolve(&lookup)?
            .map(|(proxy, selector)| InputLayerProxy::with_selector(proxy, selector)))
    }

    fn resolve<P: InputLayer>(
        &self,
        lookup: &impl Fn(LayerProxyId) -> Option<Arc<P>>,
    ) -> Result<ScribeLoad<(Arc<P>, P::Selector)>, ScribeError> {
        let Some(selector) = P::Selector::from_scribe_id(&self.subject_token) else {
            tracing::warn!(
                layer = %self.layer,
                id = %self.subject_token,
                "unknown subject token id in archive"
            );
            return Ok(ScribeLoad::UnknownType {
                id: self.subject_token.clone(),
            });
        };
        let proxy = lookup(self.layer).ok_or(ScribeError::MissingLayer(self.layer))?;
        Ok(ScribeLoad::Loaded((proxy, selector)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OptionalInputLayerProxyRecord {
    pub input: Option<InputLayerProxyRecord>,
}

impl OptionalInputLayerProxyRecord {
    pub fn save<P: InputLayer>(input: &OptionalInputLayerProxy<P>) -> Self {
        OptionalInputLayerProxyRecord {
            input: input.input().map(InputLayerProxyRecord::save),
        }
    }

    pub fn load<P: InputLayer>(
        &self,
        lookup: impl Fn(LayerProxyId) -> Option<Arc<P>>,
    ) -> Result<ScribeLoad<OptionalInputLayerProxy<P>>, ScribeError> {
        let mut loaded = OptionalInputLayerProxy::new();
        if let Some(record) = &self.input {
            match record.resolve(&lookup)? {
                ScribeLoad::Loaded((proxy, selector)) => {
                    loaded.set_input_layer_proxy_with_selector(Some(proxy), selector);
                }
                ScribeLoad::UnknownType { id } => return Ok(ScribeLoad::UnknownType { id }),
            }
        }
        Ok(ScribeLoad::Loaded(loaded))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InputLayerProxySequenceRecord {
    pub inputs: Vec<InputLayerProxyRecord>,
}

impl InputLayerProxySequenceRecord {
    pub fn save<P: InputLayer>(sequence: &InputLayerProxySequence<P>) -> Self {
        InputLayerProxySequenceRecord {
            inputs: sequence.inputs().iter().map(InputLayerProxyRecord::save).collect(),
        }
    }

    /// Fails as a whole if any element has an unknown token id.
    pub fn load<P: InputLayer>(
        &self,
        lookup: impl Fn(LayerProxyId) -> Option<Arc<P>>,
    ) -> Result<ScribeLoad<InputLayerProxySequence<P>>, ScribeError> {
        let mut resolved = Vec::with_capacity(self.inputs.len());
        for record in &self.inputs {
            match record.resolve(&lookup)? {
                ScribeLoad::Loaded(input) => resolved.push(input),
                ScribeLoad::UnknownType { id } => return Ok(ScribeLoad::UnknownType { id }),
            }
        }
        let mut sequence = InputLayerProxySequence::new();
        sequence.set_input_layer_proxies_with_selector(resolved);
        Ok(ScribeLoad::Loaded(sequence))
    }
}

/// A versioned JSON envelope around any record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScribeArchive<T> {
    pub version: u32,
    pub body: T,
}

impl<T: Serialize + DeserializeOwned> ScribeArchive<T> {
    pub fn new(body: T) -> Self {
        ScribeArchive {
            version: SCRIBE_VERSION,
            body,
        }
    }

    pub fn to_json(&self) -> Result<String, ScribeError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Archives from an older version load unchanged; newer ones are refused.
    pub fn from_json(json: &str) -> Result<T, ScribeError> {
        let archive: ScribeArchive<T> = serde_json::from_str(json)?;
        if archive.version > SCRIBE_VERSION {
            return Err(ScribeError::VersionMismatch {
                found: archive.version,
                expected: SCRIBE_VERSION,
            });
        }
        Ok(archive.body)
    }
}
