use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use localtime::LocalTime;
use serde::{Deserialize, Serialize};

/// Per-request causal record: a tree of spans with a single root, guarded
/// by one mutex per tracer. Spans are started by endpoints around fn
/// execution and finished in LIFO order within a tracer; remote call spans
/// are grafted back under the caller's current span.
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<Inner>,
}

struct Inner {
    id: String,
    state: Mutex<Tree>,
}

#[derive(Default)]
struct Tree {
    spans: Vec<SpanData>,
    root: Option<usize>,
    current: Option<usize>,
}

struct SpanData {
    id: String,
    service: String,
    fn_name: String,
    started_at: LocalTime,
    finished_at: Option<LocalTime>,
    parent: Option<usize>,
    children: Vec<usize>,
    tags: BTreeMap<String, String>,
    /// Remote subtrees grafted under this span.
    mounted: Vec<SpanTree>,
}

impl SpanData {
    fn new(service: &str, fn_name: &str, parent: Option<usize>) -> Self {
        Self {
            id: format!("{:016x}", fastrand::u64(..)),
            service: service.to_string(),
            fn_name: fn_name.to_string(),
            started_at: LocalTime::now(),
            finished_at: None,
            parent,
            children: Vec::new(),
            tags: BTreeMap::new(),
            mounted: Vec::new(),
        }
    }
}

impl Tracer {
    /// Create the tracer for one request; `id` equals the request id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: id.into(),
                state: Mutex::new(Tree::default()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Whether any span has been started. A started tracer marks a request
    /// that originated inside another handler.
    pub fn started(&self) -> bool {
        self.inner.state.lock().unwrap().root.is_some()
    }

    /// Start a span. The first span becomes the root; while the current
    /// span is unfinished new spans nest under it; once it has finished
    /// they become its siblings. A finished root stays the root: late
    /// spans attach under it so the tree keeps exactly one root.
    pub fn start_span(&self, service: &str, fn_name: &str) -> Span {
        let mut tree = self.inner.state.lock().unwrap();
        let index = tree.spans.len();
        match tree.current {
            None => {
                tree.spans.push(SpanData::new(service, fn_name, None));
                tree.root = Some(index);
            }
            Some(current) => {
                let finished = tree.spans[current].finished_at.is_some();
                let parent = if finished {
                    // Sibling of the finished span, except at the root.
                    tree.spans[current].parent.unwrap_or(current)
                } else {
                    current
                };
                tree.spans.push(SpanData::new(service, fn_name, Some(parent)));
                tree.spans[parent].children.push(index);
            }
        }
        tree.current = Some(index);
        Span {
            tracer: self.clone(),
            index,
        }
    }

    /// Graft a remote span subtree under the current span (or make it the
    /// root when the tracer is empty, as happens in proxies).
    pub fn mount(&self, remote: SpanTree) {
        let mut tree = self.inner.state.lock().unwrap();
        match tree.current {
            Some(current) => tree.spans[current].mounted.push(remote),
            None => {
                let index = tree.spans.len();
                let mut data = SpanData::new(&remote.service, &remote.fn_name, None);
                data.id = remote.id.clone();
                data.started_at = remote.started_at;
                data.finished_at = remote.finished_at;
                data.tags = remote.tags.clone();
                data.mounted = remote.children;
                tree.spans.push(data);
                tree.root = Some(index);
                tree.current = Some(index);
            }
        }
    }

    /// Snapshot of the whole tree, if a root exists.
    pub fn root(&self) -> Option<SpanTree> {
        let tree = self.inner.state.lock().unwrap();
        tree.root.map(|root| build(&tree, root, &self.inner.id))
    }

    fn finish(&self, index: usize) {
        let mut tree = self.inner.state.lock().unwrap();
        if tree.spans[index].finished_at.is_some() {
            return;
        }
        tree.spans[index].finished_at = Some(LocalTime::now());
        // LIFO: finishing pops back to this span, so the next start
        // becomes its sibling.
        tree.current = Some(index);
    }

    fn tag(&self, index: usize, key: &str, value: &str) {
        let mut tree = self.inner.state.lock().unwrap();
        tree.spans[index]
            .tags
            .insert(key.to_string(), value.to_string());
    }

    fn latency(&self, index: usize) -> Option<u64> {
        let tree = self.inner.state.lock().unwrap();
        let span = &tree.spans[index];
        span.finished_at
            .map(|f| f.as_millis().saturating_sub(span.started_at.as_millis()) as u64)
    }
}

fn build(tree: &Tree, index: usize, tracer_id: &str) -> SpanTree {
    let span = &tree.spans[index];
    let mut children: Vec<SpanTree> = span
        .children
        .iter()
        .map(|child| build(tree, *child, tracer_id))
        .collect();
    children.extend(span.mounted.iter().cloned());
    SpanTree {
        id: span.id.clone(),
        tracer_id: tracer_id.to_string(),
        service: span.service.clone(),
        fn_name: span.fn_name.clone(),
        started_at: span.started_at,
        finished_at: span.finished_at,
        tags: span.tags.clone(),
        children,
    }
}

/// Handle to one span of a tracer.
#[derive(Clone)]
pub struct Span {
    tracer: Tracer,
    index: usize,
}

impl Span {
    /// Finish the span; finishing twice is ignored.
    pub fn finish(&self) {
        self.tracer.finish(self.index);
    }

    pub fn tag(&self, key: &str, value: &str) {
        self.tracer.tag(self.index, key, value);
    }

    /// Milliseconds between start and finish, once finished.
    pub fn latency(&self) -> Option<u64> {
        self.tracer.latency(self.index)
    }
}

/// Serialized span tree carried by internal response envelopes and handed
/// to the `tracings` service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanTree {
    pub id: String,
    pub tracer_id: String,
    pub service: String,
    #[serde(rename = "fn")]
    pub fn_name: String,
    pub started_at: LocalTime,
    pub finished_at: Option<LocalTime>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<SpanTree>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_single_root_nesting() {
        let tracer = Tracer::new("req-1");
        assert!(!tracer.started());

        let root = tracer.start_span("math", "add");
        let child = tracer.start_span("users", "load");
        child.finish();
        let sibling = tracer.start_span("users", "save");
        sibling.finish();
        root.finish();

        let tree = tracer.root().unwrap();
        assert_eq!(tree.service, "math");
        assert_eq!(tree.children.len(), 2);
        assert_eq!(tree.children[0].fn_name, "load");
        assert_eq!(tree.children[1].fn_name, "save");
        assert!(tree.children.iter().all(|c| c.children.is_empty()));
    }

    #[test]
    fn test_finish_is_idempotent_and_latency_non_negative() {
        let tracer = Tracer::new("req-2");
        let span = tracer.start_span("slow", "sleep");
        span.finish();
        let first = span.latency().unwrap();
        span.finish();

        assert_eq!(span.latency().unwrap(), first);
        assert!(tracer.root().unwrap().finished_at.is_some());
    }

    #[test]
    fn test_child_interval_within_parent() {
        let tracer = Tracer::new("req-3");
        let parent = tracer.start_span("a", "outer");
        let child = tracer.start_span("a", "inner");
        child.finish();
        parent.finish();

        let tree = tracer.root().unwrap();
        let inner = &tree.children[0];
        assert!(inner.started_at >= tree.started_at);
        assert!(inner.finished_at.unwrap() <= tree.finished_at.unwrap());
    }

    #[test]
    fn test_finished_root_keeps_single_root() {
        let tracer = Tracer::new("req-4");
        let root = tracer.start_span("a", "one");
        root.finish();
        let late = tracer.start_span("a", "two");
        late.finish();

        let tree = tracer.root().unwrap();
        assert_eq!(tree.fn_name, "one");
        assert_eq!(tree.children.len(), 1);
        assert_eq!(tree.children[0].fn_name, "two");
    }

    #[test]
    fn test_mount_grafts_remote_tree() {
        let tracer = Tracer::new("req-5");
        let span = tracer.start_span("gateway", "proxy");
        let remote = SpanTree {
            id: "r-1".to_string(),
            tracer_id: "req-5".to_string(),
            service: "payments".to_string(),
            fn_name: "charge".to_string(),
            started_at: LocalTime::now(),
            finished_at: Some(LocalTime::now()),
            tags: BTreeMap::new(),
            children: Vec::new(),
        };
        tracer.mount(remote.clone());
        span.finish();

        let tree = tracer.root().unwrap();
        assert_eq!(tree.children, vec![remote]);
    }
}
