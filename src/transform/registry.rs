//! Transformer registry.
//!
//! Holds one shared transformer per (client dialect, backend protocol)
//! route, keyed by name (`claude-to-gemini`, `openai-chat-to-native`, ...).
//! Transformers are stateless, so the registry is built once at startup and
//! shared behind an `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Protocol;
use crate::transform::chat_client::ChatClient;
use crate::transform::gemini::GeminiCodec;
use crate::transform::native::{ClaudeClient, NativeCodec, NativePassthrough};
use crate::transform::openai_chat::OpenAiChatCodec;
use crate::transform::responses::ResponsesCodec;
use crate::transform::{BackendCodec, ClientCodec};
use crate::transformer::{transformer_name, Bridge, ClientFormat, Transformer};

pub struct TransformerRegistry {
    transformers: HashMap<String, Arc<dyn Transformer>>,
    clients: HashMap<ClientFormat, Arc<dyn ClientCodec>>,
}

fn backend_codec(protocol: Protocol) -> Arc<dyn BackendCodec> {
    match protocol {
        Protocol::Native => Arc::new(NativeCodec),
        Protocol::OpenaiChat => Arc::new(OpenAiChatCodec),
        Protocol::OpenaiResponses => Arc::new(ResponsesCodec),
        Protocol::Gemini => Arc::new(GeminiCodec),
    }
}

fn client_codec(format: ClientFormat) -> Arc<dyn ClientCodec> {
    match format {
        ClientFormat::Claude => Arc::new(ClaudeClient),
        ClientFormat::OpenaiChat => Arc::new(ChatClient),
    }
}

impl TransformerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            transformers: HashMap::new(),
            clients: HashMap::new(),
        }
    }

    /// Registry with every client × backend route populated.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for format in ClientFormat::ALL {
            let client = client_codec(format);
            registry.clients.insert(format, client.clone());
            for protocol in Protocol::ALL {
                if format == ClientFormat::Claude && protocol == Protocol::Native {
                    registry.register(Arc::new(NativePassthrough::new()));
                    continue;
                }
                registry.register(Arc::new(Bridge::new(
                    format,
                    client.clone(),
                    backend_codec(protocol),
                )));
            }
        }
        registry
    }

    /// Register a transformer under its own name, replacing any previous one.
    pub fn register(&mut self, transformer: Arc<dyn Transformer>) {
        self.transformers
            .insert(transformer.name().to_string(), transformer);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Transformer>> {
        self.transformers.get(name).cloned()
    }

    /// Transformer for a client dialect talking to a backend protocol.
    pub fn for_route(&self, client: ClientFormat, backend: Protocol) -> Option<Arc<dyn Transformer>> {
        self.get(&transformer_name(client, backend))
    }

    /// Codec used to read inbound requests of a client dialect.
    pub fn client(&self, format: ClientFormat) -> Arc<dyn ClientCodec> {
        self.clients
            .get(&format)
            .cloned()
            .unwrap_or_else(|| client_codec(format))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.transformers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.transformers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transformers.is_empty()
    }
}

impl Default for TransformerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
