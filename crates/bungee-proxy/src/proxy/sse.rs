//! Stateful rewriting of `text/event-stream` bodies.
//!
//! The transformer is a small state machine fed raw upstream bytes and
//! producing rewritten SSE frames. Two modes exist:
//!
//! - **Phased**: `start` / `chunk` / `end` rule sets drive an
//!   Anthropic-style event lifecycle. `data: [DONE]` or a terminal chunk
//!   triggers the `end` rules; rule application may fan one upstream
//!   event out into several via `__multi_events`.
//! - **Legacy**: one rule set applied to every `data:` event; `[DONE]`
//!   and unknown event lines pass through.

use crate::config::{ModificationRules, StreamRules, StreamTransformRules};
use crate::expression::{Evaluator, RequestContext, StreamPhase};
use crate::rules::{apply_body_rules, Applied};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

pub struct SseTransformer {
    rules: StreamRules,
    evaluator: Arc<Evaluator>,
    ctx: RequestContext,
    has_started: bool,
    is_finished: bool,
    chunk_index: i64,
    buffer: String,
}

impl SseTransformer {
    pub fn new(rules: StreamRules, evaluator: Arc<Evaluator>, ctx: RequestContext) -> Self {
        Self {
            rules,
            evaluator,
            ctx,
            has_started: false,
            is_finished: false,
            chunk_index: 0,
            buffer: String::new(),
        }
    }

    /// Feed upstream bytes; returns rewritten output, possibly empty
    /// while a frame is still incomplete.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut out = String::new();
        loop {
            let Some((end, terminator)) = frame_bounds(&self.buffer) else {
                break;
            };
            let raw: String = self.buffer.drain(..end + terminator).collect();
            self.process_frame(&raw[..end], &mut out);
        }
        out
    }

    /// Flush at end of stream: drains a trailing partial frame and, when
    /// no terminal was observed, synthesizes the configured end event.
    pub fn finish(&mut self) -> String {
        let mut out = String::new();
        if !self.buffer.is_empty() {
            let frame = std::mem::take(&mut self.buffer);
            self.process_frame(&frame, &mut out);
        }
        if !self.is_finished {
            let end = match self.rules {
                StreamRules::Phased(ref phased) => phased.end.clone(),
                StreamRules::Legacy(_) => None,
            };
            if let Some(end) = end {
                let events = self.apply_phase(&end, Value::Object(Default::default()), "end");
                emit(&events, &mut out);
                self.is_finished = true;
            }
        }
        out
    }

    fn process_frame(&mut self, frame: &str, out: &mut String) {
        match self.rules.clone() {
            StreamRules::Phased(phased) => self.process_phased(&phased, frame, out),
            StreamRules::Legacy(rules) => self.process_legacy(&rules, frame, out),
        }
    }

    fn process_phased(&mut self, phased: &StreamTransformRules, frame: &str, out: &mut String) {
        if self.is_finished {
            return;
        }

        // In state-machine mode only `data:` lines participate; other
        // event lines are dropped.
        let Some(data) = first_data_line(frame) else {
            return;
        };

        if data == "[DONE]" {
            if let Some(ref end) = phased.end {
                let events = self.apply_phase(end, Value::Object(Default::default()), "end");
                emit(&events, out);
            }
            self.is_finished = true;
            return;
        }

        let payload: Value = match serde_json::from_str(data) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("dropping unparseable SSE event: {e}");
                return;
            }
        };

        if !self.has_started {
            self.has_started = true;
            if let Some(ref start) = phased.start {
                let events = self.apply_phase(start, payload.clone(), "start");
                emit(&events, out);
            }
        }

        if is_terminal_chunk(&payload) && phased.end.is_some() {
            let end = phased.end.as_ref().unwrap();
            let events = self.apply_phase(end, payload, "end");
            emit(&events, out);
            self.is_finished = true;
            return;
        }

        match phased.chunk {
            Some(ref chunk) => {
                let events = self.apply_phase(chunk, payload, "chunk");
                emit(&events, out);
            }
            None => emit(std::slice::from_ref(&payload), out),
        }
        self.chunk_index += 1;
    }

    fn process_legacy(&mut self, rules: &ModificationRules, frame: &str, out: &mut String) {
        for line in frame.lines() {
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if data == "[DONE]" {
                    out.push_str("data: [DONE]\n\n");
                    continue;
                }
                match serde_json::from_str::<Value>(data) {
                    Ok(payload) => {
                        let events = self.apply_phase(rules, payload, "chunk");
                        emit(&events, out);
                        self.chunk_index += 1;
                    }
                    Err(e) => warn!("dropping unparseable SSE event: {e}"),
                }
            } else if !line.is_empty() {
                // Unknown event lines are forwarded verbatim in legacy mode.
                out.push_str(line);
                out.push_str("\n\n");
            }
        }
    }

    fn apply_phase(
        &mut self,
        rules: &ModificationRules,
        payload: Value,
        phase: &'static str,
    ) -> Vec<Value> {
        self.ctx.stream = Some(StreamPhase {
            phase,
            chunk_index: self.chunk_index,
        });
        self.ctx.body = payload.clone();

        match apply_body_rules(payload, rules, &self.ctx, &self.evaluator) {
            Applied::One(event) => vec![event],
            Applied::Many(events) => events,
        }
    }
}

/// Find the next complete frame; accepts `\n\n` and `\r\n\r\n`
/// terminators. Returns the frame end offset and the terminator length.
fn frame_bounds(buffer: &str) -> Option<(usize, usize)> {
    let lf = buffer.find("\n\n").map(|i| (i, 2));
    let crlf = buffer.find("\r\n\r\n").map(|i| (i, 4));

    match (lf, crlf) {
        (Some((a, al)), Some((b, bl))) => {
            if b < a {
                Some((b, bl))
            } else {
                Some((a, al))
            }
        }
        (Some(pair), None) | (None, Some(pair)) => Some(pair),
        (None, None) => None,
    }
}

fn first_data_line(frame: &str) -> Option<&str> {
    frame
        .lines()
        .find_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
}

/// A chunk is terminal when any provider's finish marker is set.
fn is_terminal_chunk(payload: &Value) -> bool {
    let set = |v: &Value| !v.is_null();

    if let Some(reason) = payload
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("finishReason"))
    {
        if set(reason) {
            return true;
        }
    }
    if let Some(reason) = payload
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("finish_reason"))
    {
        if set(reason) {
            return true;
        }
    }
    payload.get("finishReason").map(set).unwrap_or(false)
}

/// Write each non-empty object as a `data: <compact JSON>\n\n` frame;
/// non-object results are skipped.
fn emit(events: &[Value], out: &mut String) {
    for event in events {
        let Value::Object(map) = event else {
            continue;
        };
        if map.is_empty() {
            continue;
        }
        if let Ok(encoded) = serde_json::to_string(event) {
            out.push_str("data: ");
            out.push_str(&encoded);
            out.push_str("\n\n");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn phased(v: serde_json::Value) -> StreamRules {
        StreamRules::Phased(serde_json::from_value(v).unwrap())
    }

    fn transformer(rules: StreamRules) -> SseTransformer {
        SseTransformer::new(rules, Arc::new(Evaluator::new()), RequestContext::default())
    }

    fn collect_events(out: &str) -> Vec<Value> {
        out.split("\n\n")
            .filter(|frame| !frame.is_empty())
            .map(|frame| {
                let data = frame.strip_prefix("data: ").expect("data frame");
                serde_json::from_str(data).expect("json event")
            })
            .collect()
    }

    // The scenario from the stream lifecycle: start produces
    // message_start, the first chunk opens a content block, later chunks
    // emit deltas, and the terminal chunk fans out into a delta plus a
    // stop event.
    #[test]
    fn test_phased_lifecycle_with_fan_out() {
        let rules = phased(json!({
            "start": {"add": {"type": "message_start"}},
            "chunk": {"add": {
                "type": "{{ if stream.chunkIndex == 0 { \"content_block_start\" } else { \"content_block_delta\" } }}",
                "index": "{{ stream.chunkIndex }}"
            }},
            "end": {"add": {
                "__multi_events": [{"type": "message_delta"}, {"type": "message_stop"}]
            }}
        }));

        let mut t = transformer(rules);
        let mut out = String::new();
        out.push_str(&t.push(b"data: {\"text\":\"a\"}\n\n"));
        out.push_str(&t.push(b"data: {\"text\":\"b\"}\n\n"));
        out.push_str(&t.push(b"data: {\"text\":\"c\"}\n\n"));
        out.push_str(&t.push(b"data: {\"finishReason\":\"stop\"}\n\n"));
        out.push_str(&t.finish());

        let types: Vec<String> = collect_events(&out)
            .iter()
            .map(|e| e["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            types,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "message_delta",
                "message_stop",
            ]
        );
    }

    #[test]
    fn test_done_triggers_end_once() {
        let rules = phased(json!({
            "end": {"add": {"type": "message_stop"}}
        }));
        let mut t = transformer(rules);
        let mut out = String::new();
        out.push_str(&t.push(b"data: {\"x\":1}\n\ndata: [DONE]\n\n"));
        out.push_str(&t.finish());

        let events = collect_events(&out);
        let stops = events
            .iter()
            .filter(|e| e["type"] == json!("message_stop"))
            .count();
        assert_eq!(stops, 1);
    }

    #[test]
    fn test_end_synthesized_on_flush_without_terminal() {
        let rules = phased(json!({
            "end": {"add": {"type": "message_stop"}}
        }));
        let mut t = transformer(rules);
        let mut out = String::new();
        out.push_str(&t.push(b"data: {\"x\":1}\n\n"));
        out.push_str(&t.finish());

        let events = collect_events(&out);
        assert_eq!(events.last().unwrap()["type"], json!("message_stop"));
    }

    #[test]
    fn test_crlf_frames_accepted() {
        let rules = phased(json!({"chunk": {"add": {"seen": true}}}));
        let mut t = transformer(rules);
        let out = t.push(b"data: {\"x\":1}\r\n\r\n");
        let events = collect_events(&out);
        assert_eq!(events[0]["seen"], json!(true));
    }

    #[test]
    fn test_split_frames_buffered() {
        let rules = phased(json!({"chunk": {"add": {"seen": true}}}));
        let mut t = transformer(rules);
        assert!(t.push(b"data: {\"x\"").is_empty());
        let out = t.push(b":1}\n\n");
        assert_eq!(collect_events(&out).len(), 1);
    }

    #[test]
    fn test_terminal_detection_variants() {
        assert!(is_terminal_chunk(&json!({"finishReason": "stop"})));
        assert!(is_terminal_chunk(
            &json!({"choices": [{"finish_reason": "stop"}]})
        ));
        assert!(is_terminal_chunk(
            &json!({"candidates": [{"finishReason": "STOP"}]})
        ));
        assert!(!is_terminal_chunk(
            &json!({"choices": [{"finish_reason": null}]})
        ));
        assert!(!is_terminal_chunk(&json!({"delta": "text"})));
    }

    #[test]
    fn test_legacy_mode_passthrough_behaviors() {
        let rules = StreamRules::Legacy(
            serde_json::from_value(json!({"add": {"transformed": true}})).unwrap(),
        );
        let mut t = transformer(rules);
        let mut out = String::new();
        out.push_str(&t.push(b"event: ping\n\n"));
        out.push_str(&t.push(b"data: {\"x\":1}\n\n"));
        out.push_str(&t.push(b"data: [DONE]\n\n"));

        assert!(out.contains("event: ping\n\n"));
        assert!(out.contains("data: [DONE]\n\n"));
        let transformed: Vec<Value> = out
            .split("\n\n")
            .filter(|f| f.starts_with("data: {"))
            .map(|f| serde_json::from_str(f.strip_prefix("data: ").unwrap()).unwrap())
            .collect();
        assert_eq!(transformed, vec![json!({"x": 1, "transformed": true})]);
    }

    #[test]
    fn test_non_data_dropped_in_phased_mode() {
        let rules = phased(json!({"chunk": {"add": {"seen": true}}}));
        let mut t = transformer(rules);
        let out = t.push(b"event: ping\n\n");
        assert!(out.is_empty());
    }

    #[test]
    fn test_empty_fan_out_emits_nothing() {
        let rules = phased(json!({
            "chunk": {"add": {"__multi_events": []}}
        }));
        let mut t = transformer(rules);
        let out = t.push(b"data: {\"x\":1}\n\n");
        assert!(out.is_empty());
    }

    #[test]
    fn test_frames_after_end_dropped() {
        let rules = phased(json!({
            "chunk": {"add": {"type": "delta"}},
            "end": {"add": {"type": "stop"}}
        }));
        let mut t = transformer(rules);
        let mut out = String::new();
        out.push_str(&t.push(b"data: {\"finishReason\":\"stop\"}\n\n"));
        out.push_str(&t.push(b"data: {\"late\":true}\n\n"));
        let events = collect_events(&out);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], json!("stop"));
    }
}
