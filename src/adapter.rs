use crate::dedup::StreamEvent;
use serde_json::{json, Map, Value};

/// Translate an Anthropic `/v1/messages` body into an OpenAI chat-completions
/// body for an openai-typed provider.
pub fn openai_request_from_anthropic(body: &Value, upstream_model: &str, stream: bool) -> Value {
    let mut messages: Vec<Value> = Vec::new();

    if let Some(system) = body.get("system") {
        let text = flatten_text(system);
        if !text.is_empty() {
            messages.push(json!({ "role": "system", "content": text }));
        }
    }

    for message in body
        .get("messages")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
    {
        let role = message.get("role").and_then(|v| v.as_str()).unwrap_or("user");
        match message.get("content") {
            Some(Value::String(text)) => {
                messages.push(json!({ "role": role, "content": text }));
            }
            Some(Value::Array(blocks)) => {
                encode_blocks(role, blocks, &mut messages);
            }
            _ => {}
        }
    }

    let mut out = json!({
        "model": upstream_model,
        "messages": messages,
        "stream": stream,
    });
    let obj = out.as_object_mut().expect("chat request object");

    if let Some(max_tokens) = body.get("max_tokens") {
        obj.insert("max_tokens".to_string(), max_tokens.clone());
    }
    for field in ["temperature", "top_p"] {
        if let Some(value) = body.get(field) {
            obj.insert(field.to_string(), value.clone());
        }
    }
    if let Some(stop) = body.get("stop_sequences") {
        obj.insert("stop".to_string(), stop.clone());
    }
    if let Some(tools) = body.get("tools").and_then(|v| v.as_array()) {
        let tools: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.get("name").cloned().unwrap_or_default(),
                        "description": tool.get("description").cloned().unwrap_or_default(),
                        "parameters": tool.get("input_schema").cloned().unwrap_or(json!({})),
                    }
                })
            })
            .collect();
        if !tools.is_empty() {
            obj.insert("tools".to_string(), Value::Array(tools));
        }
    }
    if let Some(choice) = body.get("tool_choice") {
        obj.insert("tool_choice".to_string(), encode_tool_choice(choice));
    }
    if stream {
        obj.insert("stream_options".to_string(), json!({ "include_usage": true }));
    }
    out
}

fn encode_blocks(role: &str, blocks: &[Value], messages: &mut Vec<Value>) {
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    for block in blocks {
        match block.get("type").and_then(|v| v.as_str()) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                    text_parts.push(text.to_string());
                }
            }
            Some("tool_use") => {
                tool_calls.push(json!({
                    "id": block.get("id").cloned().unwrap_or_default(),
                    "type": "function",
                    "function": {
                        "name": block.get("name").cloned().unwrap_or_default(),
                        "arguments": block
                            .get("input")
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| "{}".to_string()),
                    }
                }));
            }
            Some("tool_result") => {
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": block.get("tool_use_id").cloned().unwrap_or_default(),
                    "content": flatten_text(block.get("content").unwrap_or(&Value::Null)),
                }));
            }
            other => {
                tracing::debug!(block_type = other.unwrap_or("?"), "dropping untranslatable content block");
            }
        }
    }

    if text_parts.is_empty() && tool_calls.is_empty() {
        return;
    }
    let mut message = Map::new();
    message.insert("role".to_string(), Value::String(role.to_string()));
    message.insert(
        "content".to_string(),
        if text_parts.is_empty() {
            Value::Null
        } else {
            Value::String(text_parts.join("\n"))
        },
    );
    if !tool_calls.is_empty() {
        message.insert("tool_calls".to_string(), Value::Array(tool_calls));
    }
    messages.push(Value::Object(message));
}

fn encode_tool_choice(choice: &Value) -> Value {
    match choice.get("type").and_then(|v| v.as_str()) {
        Some("any") => json!("required"),
        Some("tool") => json!({
            "type": "function",
            "function": { "name": choice.get("name").cloned().unwrap_or_default() }
        }),
        _ => json!("auto"),
    }
}

/// Flatten a string-or-block-list value into plain text.
fn flatten_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(|v| v.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Translate a buffered OpenAI chat-completions response into the Anthropic
/// response shape, reporting the client's original model string.
pub fn anthropic_response_from_openai(value: &Value, client_model: &str) -> Value {
    let choice = value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|choices| choices.first())
        .cloned()
        .unwrap_or(Value::Null);
    let message = choice.get("message").cloned().unwrap_or(Value::Null);

    let mut content: Vec<Value> = Vec::new();
    if let Some(text) = message.get("content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            content.push(json!({ "type": "text", "text": text }));
        }
    }
    for call in message
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
    {
        let function = call.get("function").cloned().unwrap_or(Value::Null);
        let arguments = function
            .get("arguments")
            .and_then(|v| v.as_str())
            .unwrap_or("{}");
        let input: Value =
            serde_json::from_str(arguments).unwrap_or_else(|_| json!({ "_raw": arguments }));
        content.push(json!({
            "type": "tool_use",
            "id": call.get("id").cloned().unwrap_or_default(),
            "name": function.get("name").cloned().unwrap_or_default(),
            "input": input,
        }));
    }

    let finish_reason = choice.get("finish_reason").and_then(|v| v.as_str());
    let usage = value.get("usage").cloned().unwrap_or(Value::Null);

    json!({
        "id": value
            .get("id")
            .and_then(|v| v.as_str())
            .map(|id| format!("msg_{id}"))
            .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple())),
        "type": "message",
        "role": "assistant",
        "model": client_model,
        "content": content,
        "stop_reason": stop_reason_from_finish(finish_reason),
        "stop_sequence": Value::Null,
        "usage": {
            "input_tokens": usage.get("prompt_tokens").cloned().unwrap_or(json!(0)),
            "output_tokens": usage.get("completion_tokens").cloned().unwrap_or(json!(0)),
        }
    })
}

fn stop_reason_from_finish(finish_reason: Option<&str>) -> &'static str {
    match finish_reason {
        Some("length") => "max_tokens",
        Some("tool_calls") => "tool_use",
        _ => "end_turn",
    }
}

/// Expand a complete Anthropic-shaped response into the event sequence a
/// streaming client expects. Used by background mode, where the upstream
/// response is fully buffered and classified before any byte is committed.
pub fn synthesize_anthropic_sse(response: &Value) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    let sse = |name: &str, data: Value| StreamEvent::Sse {
        event: Some(name.to_string()),
        data: data.to_string(),
    };

    let mut skeleton = response.clone();
    if let Some(obj) = skeleton.as_object_mut() {
        obj.insert("content".to_string(), json!([]));
        obj.insert("stop_reason".to_string(), Value::Null);
        obj.insert("stop_sequence".to_string(), Value::Null);
    }
    events.push(sse(
        "message_start",
        json!({ "type": "message_start", "message": skeleton }),
    ));

    let content = response
        .get("content")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    for (index, block) in content.iter().enumerate() {
        match block.get("type").and_then(|v| v.as_str()) {
            Some("tool_use") => {
                events.push(sse(
                    "content_block_start",
                    json!({
                        "type": "content_block_start",
                        "index": index,
                        "content_block": {
                            "type": "tool_use",
                            "id": block.get("id").cloned().unwrap_or_default(),
                            "name": block.get("name").cloned().unwrap_or_default(),
                            "input": {}
                        }
                    }),
                ));
                let partial = block
                    .get("input")
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "{}".to_string());
                events.push(sse(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": { "type": "input_json_delta", "partial_json": partial }
                    }),
                ));
            }
            _ => {
                events.push(sse(
                    "content_block_start",
                    json!({
                        "type": "content_block_start",
                        "index": index,
                        "content_block": { "type": "text", "text": "" }
                    }),
                ));
                let text = block.get("text").and_then(|v| v.as_str()).unwrap_or("");
                events.push(sse(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": { "type": "text_delta", "text": text }
                    }),
                ));
            }
        }
        events.push(sse(
            "content_block_stop",
            json!({ "type": "content_block_stop", "index": index }),
        ));
    }

    events.push(sse(
        "message_delta",
        json!({
            "type": "message_delta",
            "delta": {
                "stop_reason": response.get("stop_reason").cloned().unwrap_or(json!("end_turn")),
                "stop_sequence": response.get("stop_sequence").cloned().unwrap_or(Value::Null),
            },
            "usage": {
                "output_tokens": response
                    .get("usage")
                    .and_then(|u| u.get("output_tokens"))
                    .cloned()
                    .unwrap_or(json!(0))
            }
        }),
    ));
    events.push(sse("message_stop", json!({ "type": "message_stop" })));
    events
}

/// Incremental OpenAI-delta to Anthropic-event translation for direct-mode
/// streaming through an openai-typed provider.
pub struct OpenAiStreamTranslator {
    client_model: String,
    message_id: String,
    started: bool,
    finished: bool,
    text_index: Option<u64>,
    tool_indices: std::collections::HashMap<u64, u64>,
    open_blocks: Vec<u64>,
    next_index: u64,
    input_tokens: u64,
    output_tokens: u64,
    stop_reason: &'static str,
}

impl OpenAiStreamTranslator {
    pub fn new(client_model: &str) -> Self {
        Self {
            client_model: client_model.to_string(),
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            started: false,
            finished: false,
            text_index: None,
            tool_indices: std::collections::HashMap::new(),
            open_blocks: Vec::new(),
            next_index: 0,
            input_tokens: 0,
            output_tokens: 0,
            stop_reason: "end_turn",
        }
    }

    /// Feed one upstream SSE data payload; returns the Anthropic events it
    /// expands to. `[DONE]` produces the closing sequence.
    pub fn on_data(&mut self, data: &str) -> Vec<StreamEvent> {
        if data.trim() == "[DONE]" {
            return self.finish();
        }
        let Ok(chunk) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };
        let mut events = Vec::new();

        if let Some(usage) = chunk.get("usage") {
            if let Some(prompt) = usage.get("prompt_tokens").and_then(|v| v.as_u64()) {
                self.input_tokens = prompt;
            }
            if let Some(completion) = usage.get("completion_tokens").and_then(|v| v.as_u64()) {
                self.output_tokens = completion;
            }
        }

        let Some(choice) = chunk
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|choices| choices.first())
        else {
            return events;
        };

        self.ensure_started(&mut events);

        if let Some(delta) = choice.get("delta") {
            if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    let index = self.ensure_text_block(&mut events);
                    events.push(sse_event(
                        "content_block_delta",
                        json!({
                            "type": "content_block_delta",
                            "index": index,
                            "delta": { "type": "text_delta", "text": text }
                        }),
                    ));
                }
            }
            for call in delta
                .get("tool_calls")
                .and_then(|v| v.as_array())
                .into_iter()
                .flatten()
            {
                self.on_tool_call_delta(call, &mut events);
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            self.stop_reason = stop_reason_from_finish(Some(reason));
        }
        events
    }

    fn on_tool_call_delta(&mut self, call: &Value, events: &mut Vec<StreamEvent>) {
        let call_index = call.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
        if !self.tool_indices.contains_key(&call_index) {
            let index = self.next_index;
            self.next_index += 1;
            self.tool_indices.insert(call_index, index);
            self.open_blocks.push(index);
            let function = call.get("function").cloned().unwrap_or(Value::Null);
            events.push(sse_event(
                "content_block_start",
                json!({
                    "type": "content_block_start",
                    "index": index,
                    "content_block": {
                        "type": "tool_use",
                        "id": call.get("id").cloned().unwrap_or_default(),
                        "name": function.get("name").cloned().unwrap_or_default(),
                        "input": {}
                    }
                }),
            ));
        }
        let index = self.tool_indices[&call_index];
        if let Some(arguments) = call
            .get("function")
            .and_then(|f| f.get("arguments"))
            .and_then(|v| v.as_str())
        {
            if !arguments.is_empty() {
                events.push(sse_event(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": { "type": "input_json_delta", "partial_json": arguments }
                    }),
                ));
            }
        }
    }

    fn ensure_started(&mut self, events: &mut Vec<StreamEvent>) {
        if self.started {
            return;
        }
        self.started = true;
        events.push(sse_event(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.client_model,
                    "content": [],
                    "stop_reason": Value::Null,
                    "stop_sequence": Value::Null,
                    "usage": { "input_tokens": self.input_tokens, "output_tokens": 0 }
                }
            }),
        ));
    }

    fn ensure_text_block(&mut self, events: &mut Vec<StreamEvent>) -> u64 {
        if let Some(index) = self.text_index {
            return index;
        }
        let index = self.next_index;
        self.next_index += 1;
        self.text_index = Some(index);
        self.open_blocks.push(index);
        events.push(sse_event(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": index,
                "content_block": { "type": "text", "text": "" }
            }),
        ));
        index
    }

    /// Close any open blocks and emit the terminal events. Idempotent.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let mut events = Vec::new();
        self.ensure_started(&mut events);
        for index in self.open_blocks.drain(..) {
            events.push(sse_event(
                "content_block_stop",
                json!({ "type": "content_block_stop", "index": index }),
            ));
        }
        events.push(sse_event(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": { "stop_reason": self.stop_reason, "stop_sequence": Value::Null },
                "usage": { "output_tokens": self.output_tokens }
            }),
        ));
        events.push(sse_event("message_stop", json!({ "type": "message_stop" })));
        events
    }
}

fn sse_event(name: &str, data: Value) -> StreamEvent {
    StreamEvent::Sse {
        event: Some(name.to_string()),
        data: data.to_string(),
    }
}
