//! Input wrappers
//!
//! A downstream proxy never holds a bare upstream proxy. It holds a wrapper
//! that pairs the upstream proxy with the token it watches and an
//! [`ObserverToken`] recording the last state it consumed.

use super::{InputLayer, SubjectTokenSelector};
use std::fmt;
use std::sync::Arc;
use tecton_model::FeatureCollectionHandle;
use tecton_types::ObserverToken;

/// One upstream proxy and the subject token polled on it.
pub struct InputLayerProxy<P: InputLayer> {
    proxy: Arc<P>,
    selector: P::Selector,
    observer: ObserverToken,
}

impl<P: InputLayer> InputLayerProxy<P> {
    /// Watch the upstream proxy's primary output token.
    pub fn new(proxy: Arc<P>) -> Self {
        Self::with_selector(proxy, P::Selector::DEFAULT)
    }

    pub fn with_selector(proxy: Arc<P>, selector: P::Selector) -> Self {
        InputLayerProxy {
            proxy,
            selector,
            observer: ObserverToken::new(),
        }
    }

    pub fn input_layer_proxy(&self) -> &Arc<P> {
        &self.proxy
    }

    pub fn selector(&self) -> P::Selector {
        self.selector
    }

    pub fn is_up_to_date(&self) -> bool {
        self.proxy
            .subject_token(self.selector)
            .is_observer_up_to_date(&self.observer)
    }

    pub fn set_up_to_date(&mut self) {
        self.proxy
            .subject_token(self.selector)
            .update_observer(&mut self.observer);
    }

    /// Same upstream proxy and same selected token.
    pub fn refers_to(&self, proxy: &Arc<P>, selector: P::Selector) -> bool {
        Arc::ptr_eq(&self.proxy, proxy) && self.selector == selector
    }
}

impl<P: InputLayer> fmt::Debug for InputLayerProxy<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputLayerProxy")
            .field("proxy", &self.proxy.layer_proxy_id())
            .field("selector", &self.selector)
            .field("observer", &self.observer)
            .finish()
    }
}

enum OptionalInput<P: InputLayer> {
    Connected(InputLayerProxy<P>),
    /// `acknowledged` is false until the owner has consumed the disconnection.
    Disconnected { acknowledged: bool },
}

/// An input that may be absent.
///
/// Removing the upstream proxy is itself a change: the input reports stale
/// until the owner calls [`set_up_to_date`](Self::set_up_to_date).
pub struct OptionalInputLayerProxy<P: InputLayer> {
    input: OptionalInput<P>,
}

impl<P: InputLayer> OptionalInputLayerProxy<P> {
    /// An input with no upstream proxy, already acknowledged.
    pub fn new() -> Self {
        OptionalInputLayerProxy {
            input: OptionalInput::Disconnected { acknowledged: true },
        }
    }

    pub fn with_proxy(proxy: Arc<P>) -> Self {
        OptionalInputLayerProxy {
            input: OptionalInput::Connected(InputLayerProxy::new(proxy)),
        }
    }

    /// Replace the upstream proxy. Returns whether anything changed.
    pub fn set_input_layer_proxy(&mut self, proxy: Option<Arc<P>>) -> bool {
        self.set_input_layer_proxy_with_selector(proxy, P::Selector::DEFAULT)
    }

    pub fn set_input_layer_proxy_with_selector(
        &mut self,
        proxy: Option<Arc<P>>,
        selector: P::Selector,
    ) -> bool {
        let unchanged = match (&self.input, &proxy) {
            (OptionalInput::Connected(current), Some(proxy)) => current.refers_to(proxy, selector),
            (OptionalInput::Disconnected { .. }, None) => true,
            _ => false,
        };
        if unchanged {
            return false;
        }
        self.input = match proxy {
            Some(proxy) => {
                OptionalInput::Connected(InputLayerProxy::with_selector(proxy, selector))
            }
            None => OptionalInput::Disconnected {
                acknowledged: false,
            },
        };
        true
    }

    pub fn get_input_layer_proxy(&self) -> Option<&Arc<P>> {
        match &self.input {
            OptionalInput::Connected(input) => Some(input.input_layer_proxy()),
            OptionalInput::Disconnected { .. } => None,
        }
    }

    pub fn input(&self) -> Option<&InputLayerProxy<P>> {
        match &self.input {
            OptionalInput::Connected(input) => Some(input),
            OptionalInput::Disconnected { .. } => None,
        }
    }

    pub fn is_up_to_date(&self) -> bool {
        match &self.input {
            OptionalInput::Connected(input) => input.is_up_to_date(),
            OptionalInput::Disconnected { acknowledged } => *acknowledged,
        }
    }

    pub fn set_up_to_date(&mut self) {
        match &mut self.input {
            OptionalInput::Connected(input) => input.set_up_to_date(),
            OptionalInput::Disconnected { acknowledged } => *acknowledged = true,
        }
    }
}

impl<P: InputLayer> Default for OptionalInputLayerProxy<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: InputLayer> fmt::Debug for OptionalInputLayerProxy<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.input {
            OptionalInput::Connected(input) => f
                .debug_tuple("OptionalInputLayerProxy")
                .field(input)
                .finish(),
            OptionalInput::Disconnected { acknowledged } => f
                .debug_struct("OptionalInputLayerProxy")
                .field("acknowledged", acknowledged)
                .finish(),
        }
    }
}

/// An unordered set of upstream proxies of one type.
pub struct InputLayerProxySequence<P: InputLayer> {
    inputs: Vec<InputLayerProxy<P>>,
}

impl<P: InputLayer> InputLayerProxySequence<P> {
    pub fn new() -> Self {
        InputLayerProxySequence { inputs: Vec::new() }
    }

    pub fn inputs(&self) -> &[InputLayerProxy<P>] {
        &self.inputs
    }

    pub fn input_layer_proxies(&self) -> impl Iterator<Item = &Arc<P>> {
        self.inputs.iter().map(InputLayerProxy::input_layer_proxy)
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Replace the whole set, each watching its primary token.
    ///
    /// Returns false, leaving every observer untouched, when the new set equals
    /// the current one regardless of order.
    pub fn set_input_layer_proxies(&mut self, proxies: impl IntoIterator<Item = Arc<P>>) -> bool {
        self.set_input_layer_proxies_with_selector(
            proxies
                .into_iter()
                .map(|proxy| (proxy, P::Selector::DEFAULT)),
        )
    }

    pub fn set_input_layer_proxies_with_selector(
        &mut self,
        proxies: impl IntoIterator<Item = (Arc<P>, P::Selector)>,
    ) -> bool {
        let mut proposed: Vec<(Arc<P>, P::Selector)> = Vec::new();
        for (proxy, selector) in proxies {
            if !proposed
                .iter()
                .any(|(p, s)| Arc::ptr_eq(p, &proxy) && *s == selector)
            {
                proposed.push((proxy, selector));
            }
        }

        let unchanged = proposed.len() == self.inputs.len()
            && proposed.iter().all(|(proxy, selector)| {
                self.inputs
                    .iter()
                    .any(|input| input.refers_to(proxy, *selector))
            });
        if unchanged {
            return false;
        }

        self.inputs = proposed
            .into_iter()
            .map(|(proxy, selector)| InputLayerProxy::with_selector(proxy, selector))
            .collect();
        true
    }

    /// Returns false if the proxy was already an input.
    pub fn add_input_layer_proxy(&mut self, proxy: Arc<P>) -> bool {
        if self
            .inputs
            .iter()
            .any(|input| input.refers_to(&proxy, P::Selector::DEFAULT))
        {
            return false;
        }
        self.inputs.push(InputLayerProxy::new(proxy));
        true
    }

    /// Returns false if the proxy was not an input.
    pub fn remove_input_layer_proxy(&mut self, proxy: &Arc<P>) -> bool {
        let before = self.inputs.len();
        self.inputs
            .retain(|input| !Arc::ptr_eq(input.input_layer_proxy(), proxy));
        before != self.inputs.len()
    }

    pub fn is_up_to_date(&self) -> bool {
        self.inputs.iter().all(InputLayerProxy::is_up_to_date)
    }

    pub fn set_up_to_date(&mut self) {
        for input in &mut self.inputs {
            input.set_up_to_date();
        }
    }

    /// Inputs whose watched token has changed.
    pub fn stale_inputs(&self) -> impl Iterator<Item = &InputLayerProxy<P>> {
        self.inputs.iter().filter(|input| !input.is_up_to_date())
    }
}

impl<P: InputLayer> Default for InputLayerProxySequence<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: InputLayer> fmt::Debug for InputLayerProxySequence<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.inputs).finish()
    }
}

/// Feature collections consumed by a proxy, each polled through its revision
/// token.
#[derive(Debug, Default)]
pub struct FeatureCollectionInputs {
    entries: Vec<(FeatureCollectionHandle, ObserverToken)>,
}

impl FeatureCollectionInputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the collection was already present.
    pub fn add(&mut self, collection: FeatureCollectionHandle) -> bool {
        if self.contains(&collection) {
            return false;
        }
        self.entries.push((collection, ObserverToken::new()));
        true
    }

    /// Returns false if the collection was not present.
    pub fn remove(&mut self, collection: &FeatureCollectionHandle) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(c, _)| !c.ptr_eq(collection));
        before != self.entries.len()
    }

    pub fn contains(&self, collection: &FeatureCollectionHandle) -> bool {
        self.entries.iter().any(|(c, _)| c.ptr_eq(collection))
    }

    pub fn collections(&self) -> Vec<FeatureCollectionHandle> {
        self.entries.iter().map(|(c, _)| c.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_up_to_date(&self) -> bool {
        self.entries
            .iter()
            .all(|(collection, observer)| {
                collection.subject_token().is_observer_up_to_date(observer)
            })
    }

    pub fn set_up_to_date(&mut self) {
        for (collection, observer) in &mut self.entries {
            collection.subject_token().update_observer(observer);
        }
    }
}
