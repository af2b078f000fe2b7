//! CPU profiles and heap diagnostics.
//!
//! CPU profiles are recorded through the inspector `Profiler` domain, one
//! private session per named profile. Stopping a profile returns the
//! protocol's flat node list, which is rebuilt here into a tree.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;

use crate::debug::{self, Session, Sink};
use crate::error::Error;
use crate::isolate::V8Isolate;

/// Heap usage as reported by V8.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStatistics {
    pub total_heap_size: usize,
    pub total_heap_size_executable: usize,
    pub total_physical_size: usize,
    pub total_available_size: usize,
    pub used_heap_size: usize,
    pub heap_size_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuProfileHitLine {
    pub line_number: i64,
    pub hit_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuProfileNode {
    pub node_id: u64,
    pub script_id: i64,
    pub script_name: String,
    pub function_name: String,
    pub bailout_reason: Option<String>,
    /// 1-based; 0 when unknown.
    pub line_number: i64,
    pub column_number: i64,
    pub hit_count: u64,
    pub hit_lines: Vec<CpuProfileHitLine>,
    pub children: Vec<CpuProfileNode>,
}

impl CpuProfileNode {
    /// This node and all of its descendants, depth first.
    pub fn walk(&self) -> Vec<&CpuProfileNode> {
        let mut nodes = vec![self];
        let mut index = 0;
        while index < nodes.len() {
            let node = nodes[index];
            nodes.extend(node.children.iter());
            index += 1;
        }
        nodes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuProfileSample {
    pub node_id: u64,
    /// Microseconds, same clock as the profile timestamps.
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuProfile {
    pub name: String,
    pub start_timestamp: u64,
    pub end_timestamp: u64,
    pub root: Option<CpuProfileNode>,
    /// Empty unless the profile was begun with `record_samples`.
    pub samples: Vec<CpuProfileSample>,
}

/// A profile between `begin_cpu_profile` and `end_cpu_profile`.
pub(crate) struct ActiveProfile {
    session: Session,
    responses: Arc<Mutex<Vec<String>>>,
    record_samples: bool,
    next_id: u64,
}

impl ActiveProfile {
    fn command(&mut self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, Error> {
        self.next_id += 1;
        let id = self.next_id;
        let message = json!({ "id": id, "method": method, "params": params }).to_string();
        self.session.dispatch(&message);

        let responses = std::mem::take(&mut *self.responses.lock());
        for response in responses {
            let response: serde_json::Value = serde_json::from_str(&response)
                .map_err(|e| Error::general(format!("Malformed inspector response: {e}")))?;
            if response.get("id").and_then(|v| v.as_u64()) != Some(id) {
                continue;
            }
            if let Some(error) = response.get("error") {
                return Err(Error::general(format!("{method} failed: {error}")));
            }
            return Ok(response.get("result").cloned().unwrap_or_default());
        }
        Err(Error::general(format!("{method} produced no response")))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProtocolProfile {
    nodes: Vec<ProtocolNode>,
    start_time: f64,
    end_time: f64,
    #[serde(default)]
    samples: Vec<u64>,
    #[serde(default)]
    time_deltas: Vec<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProtocolNode {
    id: u64,
    call_frame: CallFrame,
    #[serde(default)]
    hit_count: u64,
    #[serde(default)]
    children: Vec<u64>,
    #[serde(default)]
    deopt_reason: Option<String>,
    #[serde(default)]
    position_ticks: Vec<PositionTick>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallFrame {
    function_name: String,
    script_id: String,
    url: String,
    line_number: i64,
    column_number: i64,
}

#[derive(Deserialize)]
struct PositionTick {
    line: i64,
    ticks: u64,
}

impl ProtocolProfile {
    fn into_profile(self, name: &str, record_samples: bool) -> CpuProfile {
        let by_id: HashMap<u64, &ProtocolNode> = self.nodes.iter().map(|n| (n.id, n)).collect();
        let root = self.nodes.first().and_then(|n| build_node(n.id, &by_id, 0));

        let mut samples = Vec::new();
        if record_samples {
            let mut timestamp = self.start_time;
            for (node_id, delta) in self.samples.iter().zip(self.time_deltas.iter()) {
                timestamp += *delta as f64;
                samples.push(CpuProfileSample {
                    node_id: *node_id,
                    timestamp: timestamp as u64,
                });
            }
        }

        CpuProfile {
            name: name.to_string(),
            start_timestamp: self.start_time as u64,
            end_timestamp: self.end_time as u64,
            root,
            samples,
        }
    }
}

// V8 caps the tree depth well below this; it only guards malformed input.
const MAX_NODE_DEPTH: usize = 4096;

fn build_node(id: u64, nodes: &HashMap<u64, &ProtocolNode>, depth: usize) -> Option<CpuProfileNode> {
    if depth > MAX_NODE_DEPTH {
        return None;
    }
    let node = nodes.get(&id)?;
    let frame = &node.call_frame;
    let bailout_reason = node.deopt_reason.clone().filter(|reason| !reason.is_empty());

    Some(CpuProfileNode {
        node_id: node.id,
        script_id: frame.script_id.parse().unwrap_or(0),
        script_name: frame.url.clone(),
        function_name: frame.function_name.clone(),
        bailout_reason,
        line_number: if frame.line_number >= 0 { frame.line_number + 1 } else { 0 },
        column_number: if frame.column_number >= 0 { frame.column_number + 1 } else { 0 },
        hit_count: node.hit_count,
        hit_lines: node
            .position_ticks
            .iter()
            .map(|tick| CpuProfileHitLine {
                line_number: tick.line,
                hit_count: tick.ticks,
            })
            .collect(),
        children: node
            .children
            .iter()
            .filter_map(|child| build_node(*child, nodes, depth + 1))
            .collect(),
    })
}

impl V8Isolate {
    /// Start a named CPU profile. `false` if one with that name is running.
    pub fn begin_cpu_profile(&self, name: &str, record_samples: bool) -> Result<bool, Error> {
        let inner = self.inner.clone();
        inner.check_alive()?;
        let interval = inner.cpu_profile_sample_interval.load(Ordering::SeqCst);

        inner.with_lock(|v8_isolate| {
            // SAFETY: lock held; released before dispatching
            if unsafe { inner.debug.get_ref() }.profiles.contains_key(name) {
                return Ok(false);
            }
            let inspector = debug::inspector(&inner, v8_isolate);
            let responses = Arc::new(Mutex::new(Vec::new()));
            let mut profile = ActiveProfile {
                session: inspector.connect(Sink::Capture(responses.clone())),
                responses,
                record_samples,
                next_id: 0,
            };
            profile.command("Profiler.enable", json!({}))?;
            profile.command("Profiler.setSamplingInterval", json!({ "interval": interval }))?;
            profile.command("Profiler.start", json!({}))?;

            tracing::debug!("Started CPU profile '{}' ({}us)", name, interval);
            // SAFETY: lock held
            unsafe { inner.debug.get() }.profiles.insert(name.to_string(), profile);
            Ok(true)
        })
    }

    /// Stop a named CPU profile and hand it to `callback`. `false` if no
    /// such profile is running.
    pub fn end_cpu_profile(&self, name: &str, callback: impl FnOnce(&CpuProfile)) -> Result<bool, Error> {
        let inner = self.inner.clone();
        inner.check_alive()?;

        let stopped = inner.with_lock(|_| {
            // SAFETY: lock held; released before dispatching
            let Some(mut profile) = unsafe { inner.debug.get() }.profiles.remove(name) else {
                return Ok(None);
            };
            let result = profile.command("Profiler.stop", json!({}))?;
            profile.command("Profiler.disable", json!({}))?;

            let profile_json = result
                .get("profile")
                .cloned()
                .ok_or_else(|| Error::general("Profiler.stop returned no profile"))?;
            let protocol: ProtocolProfile = serde_json::from_value(profile_json)
                .map_err(|e| Error::general(format!("Malformed CPU profile: {e}")))?;
            Ok::<_, Error>(Some(protocol.into_profile(name, profile.record_samples)))
        })?;

        let Some(profile) = stopped else {
            return Ok(false);
        };
        tracing::debug!("Finished CPU profile '{}'", name);
        callback(&profile);
        Ok(true)
    }

    /// Samples are taken on V8's profiler thread; nothing to do on demand.
    pub fn collect_cpu_profile_sample(&self) {
        tracing::trace!("CPU profile samples are collected by the V8 profiler thread");
    }

    /// Sampling interval in microseconds for profiles begun afterwards.
    pub fn cpu_profile_sample_interval(&self) -> u32 {
        self.inner.cpu_profile_sample_interval.load(Ordering::SeqCst)
    }

    pub fn set_cpu_profile_sample_interval(&self, micros: u32) {
        self.inner
            .cpu_profile_sample_interval
            .store(micros.max(1), Ordering::SeqCst);
    }

    pub fn heap_statistics(&self) -> HeapStatistics {
        self.inner.with_lock(|isolate| {
            let mut stats = v8::HeapStatistics::default();
            isolate.get_heap_statistics(&mut stats);
            HeapStatistics {
                total_heap_size: stats.total_heap_size(),
                total_heap_size_executable: stats.total_heap_size_executable(),
                total_physical_size: stats.total_physical_size(),
                total_available_size: stats.total_available_size(),
                used_heap_size: stats.used_heap_size(),
                heap_size_limit: stats.heap_size_limit(),
            }
        })
    }

    /// Ask V8 to collect garbage. `exhaustive` repeats until the heap stops
    /// shrinking.
    pub fn collect_garbage(&self, exhaustive: bool) {
        self.inner.with_lock(|isolate| {
            isolate.low_memory_notification();
            if !exhaustive {
                return;
            }
            let mut stats = v8::HeapStatistics::default();
            isolate.get_heap_statistics(&mut stats);
            let mut used = stats.used_heap_size();
            for _ in 0..4 {
                isolate.low_memory_notification();
                isolate.get_heap_statistics(&mut stats);
                if stats.used_heap_size() >= used {
                    break;
                }
                used = stats.used_heap_size();
            }
        });
    }

    /// Stream a heap snapshot (`.heapsnapshot` JSON) into `sink`.
    pub fn write_heap_snapshot(&self, sink: &mut dyn Write) -> Result<(), Error> {
        self.inner.check_alive()?;
        let mut failure = None;
        self.inner.with_lock(|isolate| {
            isolate.take_heap_snapshot(|chunk| match sink.write_all(chunk) {
                Ok(()) => true,
                Err(e) => {
                    failure = Some(e);
                    false
                }
            });
        });
        match failure {
            Some(e) => Err(Error::general(format!("Failed to write heap snapshot: {e}"))),
            None => sink
                .flush()
                .map_err(|e| Error::general(format!("Failed to write heap snapshot: {e}"))),
        }
    }
}
