//! Trace request registry.

use std::sync::{Arc, Mutex};

use crate::fqname::MethodFqName;
use crate::id_list::IdList;
use crate::matcher::{ClassPattern, MethodPattern};
use crate::tracepoint::MethodTracepoint;

/// Whether a method is traced, counted only, and which parameters (if
/// any) are captured on each call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodConfig {
    pub enabled: bool,
    pub count_only: bool,
    /// Zero-based parameter indices whose values must be captured, in the
    /// order they should appear in the captured array.
    pub traced_params: Vec<usize>,
}

impl MethodConfig {
    pub fn enabled_all(traced_params: Vec<usize>) -> Self {
        MethodConfig {
            enabled: true,
            count_only: false,
            traced_params,
        }
    }

    pub fn enabled_count_only(traced_params: Vec<usize>) -> Self {
        MethodConfig {
            enabled: true,
            count_only: true,
            traced_params,
        }
    }

    pub fn disabled() -> Self {
        MethodConfig {
            enabled: false,
            count_only: false,
            traced_params: Vec::new(),
        }
    }

    fn measures_wall_time(&self) -> bool {
        !self.count_only
    }
}

/// Matches a [`MethodFqName`] against a class pattern plus an optional
/// method pattern. A target with no `#method` section matches every method
/// of every class the class pattern matches.
#[derive(Debug, Clone)]
pub struct MethodMatcher {
    class_pattern: ClassPattern,
    method_pattern: Option<MethodPattern>,
}

impl MethodMatcher {
    pub fn new(class_pattern: ClassPattern, method_pattern: Option<MethodPattern>) -> Self {
        MethodMatcher {
            class_pattern,
            method_pattern,
        }
    }

    pub fn matches(&self, fq_name: &MethodFqName) -> bool {
        self.class_pattern.matches(&fq_name.class)
            && self
                .method_pattern
                .as_ref()
                .map(|p| p.matches(&fq_name.method))
                .unwrap_or(true)
    }

    pub fn might_match_method_in_class(&self, class_name: &str) -> bool {
        self.class_pattern.might_match_prefix(class_name)
    }

    pub fn matches_class(&self, class_name: &str) -> bool {
        self.class_pattern.matches(class_name)
    }
}

/// Pairs a method matcher with the configuration to apply to whatever it
/// matches.
#[derive(Debug, Clone)]
pub struct TraceRequest {
    pub matcher: MethodMatcher,
    pub config: MethodConfig,
}

impl TraceRequest {
    pub fn new(matcher: MethodMatcher, config: MethodConfig) -> Self {
        TraceRequest { matcher, config }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodId(pub usize);

/// Data returned by [`TraceConfig::get_method_trace_data`]: the stable
/// method ID plus the config that currently applies.
#[derive(Debug, Clone)]
pub struct MethodTraceData {
    pub method_id: MethodId,
    pub config: MethodConfig,
}

#[derive(Default)]
struct Inner {
    requests: Vec<TraceRequest>,
    /// Method IDs already allocated, so repeat lookups reuse them.
    known_methods: std::collections::HashMap<MethodFqName, MethodId>,
}

/// Registry of trace requests: answers "does class X need instrumenting?"
/// and "what config applies to method X.m(desc)?", allocating and
/// memoizing method IDs as it goes.
pub struct TraceConfig {
    inner: Mutex<Inner>,
    methods: IdList<MethodTracepoint>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfig {
            inner: Mutex::new(Inner::default()),
            methods: IdList::new(),
        }
    }
}

impl TraceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a new request to the end of the list. Requests are never
    /// deduped: appending an identical request again is legal and
    /// shifts "most recent wins" resolution to the new entry.
    pub fn append_trace_request(&self, request: TraceRequest) {
        let mut inner = self.inner.lock().expect("trace config poisoned");
        inner.requests.push(request);
    }

    pub fn get_all_requests(&self) -> Vec<TraceRequest> {
        self.inner.lock().expect("trace config poisoned").requests.clone()
    }

    /// Removes every trace request, returning the prior list so a caller
    /// (the Controller, implementing `reset`) can compute which classes
    /// were affected.
    pub fn clear_all_requests(&self) -> Vec<TraceRequest> {
        let mut inner = self.inner.lock().expect("trace config poisoned");
        std::mem::take(&mut inner.requests)
    }

    /// True iff some currently-enabled request might match some method of
    /// `class_name`. Takes the lock.
    pub fn should_instrument_class(&self, class_name: &str) -> bool {
        let inner = self.inner.lock().expect("trace config poisoned");
        inner
            .requests
            .iter()
            .filter(|r| r.config.enabled)
            .any(|r| r.matcher.might_match_method_in_class(class_name))
    }

    /// The most-recently-appended request matching `fq_name`, if any.
    fn resolve<'a>(inner: &'a Inner, fq_name: &MethodFqName) -> Option<&'a TraceRequest> {
        inner.requests.iter().rev().find(|r| r.matcher.matches(fq_name))
    }

    /// Returns the method ID and currently-applicable config for
    /// `fq_name`, allocating a new method ID on first encounter and
    /// reusing it thereafter. Updates the canonical tracepoint's
    /// `measure_wall_time` bit on every call so that the most recent
    /// config wins at the next retransform.
    ///
    /// Returns `None` if no request currently matches (the method should
    /// not be instrumented).
    pub fn get_method_trace_data(&self, fq_name: &MethodFqName) -> Option<MethodTraceData> {
        let mut inner = self.inner.lock().expect("trace config poisoned");
        let config = Self::resolve(&inner, fq_name)?.config.clone();

        let method_id = match inner.known_methods.get(fq_name) {
            Some(id) => *id,
            None => {
                let tracepoint = MethodTracepoint::new(fq_name.clone());
                let idx = self.methods.append(tracepoint);
                let id = MethodId(idx);
                inner.known_methods.insert(fq_name.clone(), id);
                id
            }
        };

        // The tracepoint may already have existed (e.g. a previous request
        // enabled it) -- always refresh measure_wall_time so a
        // `trace count` followed by `trace all` takes effect on the next
        // retransform even though the method ID is unchanged.
        self.methods.get(method_id.0).set_measures_wall_time(config.measures_wall_time());

        Some(MethodTraceData { method_id, config })
    }

    /// Lock-free: just an `IdList` read.
    pub fn get_method_tracepoint(&self, method_id: MethodId) -> Arc<MethodTracepoint> {
        self.methods.get(method_id.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::matcher::{ClassPattern, MethodPattern};

    fn request(class: &str, method: &str, config: MethodConfig) -> TraceRequest {
        TraceRequest::new(
            MethodMatcher::new(ClassPattern::new(class), Some(MethodPattern::new(method))),
            config,
        )
    }

    #[test]
    fn method_id_is_stable_across_lookups() {
        let config = TraceConfig::new();
        config.append_trace_request(request(
            "com.example.Foo",
            "bar",
            MethodConfig::enabled_all(vec![]),
        ));
        let fq = MethodFqName::new("com.example.Foo", "bar", "()V");
        let first = config.get_method_trace_data(&fq).unwrap();
        let second = config.get_method_trace_data(&fq).unwrap();
        assert_eq!(first.method_id, second.method_id);
        assert!(std::ptr::eq(
            config.get_method_tracepoint(first.method_id).as_ref(),
            config.get_method_tracepoint(second.method_id).as_ref()
        ));
    }

    #[test]
    fn most_recent_request_wins() {
        let config = TraceConfig::new();
        let fq = MethodFqName::new("com.example.Foo", "bar", "()V");
        config.append_trace_request(request(
            "com.example.Foo",
            "*",
            MethodConfig::enabled_all(vec![]),
        ));
        config.append_trace_request(request("com.example.Foo", "bar", MethodConfig::disabled()));

        let data = config.get_method_trace_data(&fq).unwrap();
        assert!(!data.config.enabled);
    }

    #[test]
    fn untrace_keeps_history_but_disables() {
        let config = TraceConfig::new();
        config.append_trace_request(request(
            "com.example.Foo",
            "*",
            MethodConfig::enabled_all(vec![]),
        ));
        config.append_trace_request(request("com.example.Foo", "*", MethodConfig::disabled()));
        assert_eq!(config.get_all_requests().len(), 2);
        let fq = MethodFqName::new("com.example.Foo", "anyMethod", "()V");
        assert!(!config.get_method_trace_data(&fq).unwrap().config.enabled);
    }

    #[test]
    fn no_match_returns_none() {
        let config = TraceConfig::new();
        let fq = MethodFqName::new("com.example.Foo", "bar", "()V");
        assert!(config.get_method_trace_data(&fq).is_none());
    }

    #[test]
    fn count_only_then_all_updates_wall_time_bit() {
        let config = TraceConfig::new();
        let fq = MethodFqName::new("com.example.Foo", "bar", "()V");
        config.append_trace_request(request(
            "com.example.Foo",
            "bar",
            MethodConfig::enabled_count_only(vec![]),
        ));
        let data = config.get_method_trace_data(&fq).unwrap();
        let tp = config.get_method_tracepoint(data.method_id);
        assert!(!tp.measures_wall_time());

        config.append_trace_request(request(
            "com.example.Foo",
            "bar",
            MethodConfig::enabled_all(vec![]),
        ));
        let data2 = config.get_method_trace_data(&fq).unwrap();
        assert_eq!(data.method_id, data2.method_id);
        assert!(tp.measures_wall_time());
    }
}
