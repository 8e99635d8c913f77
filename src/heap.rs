use crate::value::ValueFactory;
use crate::value::ValuePtr;
use crate::value::ValueTag;
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
struct HeapStatsReport {
    total_physical_size: usize,
    total_heap_size_executable: usize,
    total_heap_size: usize,
    used_heap_size: usize,
    heap_size_limit: usize,
}

/// Reports fun facts about the isolate heap. Debugging aid; both methods
/// run on the pump thread.
pub struct HeapReporter {
    factory: Arc<ValueFactory>,
}

impl HeapReporter {
    pub fn new(factory: Arc<ValueFactory>) -> HeapReporter {
        HeapReporter { factory }
    }

    /// Headline heap statistics as a JSON string value.
    pub fn heap_stats(&self, isolate: &mut v8::Isolate) -> ValuePtr {
        let mut stats = v8::HeapStatistics::default();
        isolate.get_heap_statistics(&mut stats);

        let report = HeapStatsReport {
            total_physical_size: stats.total_physical_size(),
            total_heap_size_executable: stats.total_heap_size_executable(),
            total_heap_size: stats.total_heap_size(),
            used_heap_size: stats.used_heap_size(),
            heap_size_limit: stats.heap_size_limit(),
        };

        match serde_json::to_string(&report) {
            Ok(json) => self.factory.string(&json),
            Err(_) => self
                .factory
                .exception(ValueTag::ValueException, "heap stats did not serialize"),
        }
    }

    /// Full heap snapshot in the inspector's JSON format, streamed into a
    /// single string value.
    pub fn heap_snapshot(&self, isolate: &mut v8::Isolate) -> ValuePtr {
        let mut snapshot = Vec::new();
        isolate.take_heap_snapshot(|chunk| {
            snapshot.extend_from_slice(chunk);
            true
        });

        self.factory.string(&String::from_utf8_lossy(&snapshot))
    }
}
