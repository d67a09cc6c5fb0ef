use std::env;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use nounify_core::chat::Transcript;
use nounify_core::events::{EventPayload, EventWriter};
use nounify_core::metadata::NftMetadata;
use nounify_core::payload::AttributePayload;
use nounify_core::session::{MintRequest, SessionState};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const DEFAULT_TEXT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_CONFIRMATIONS: u64 = 1;

const CHAT_MAX_TOKENS: u64 = 400;
const CHAT_RESPONSE_COUNT: u64 = 1;
// High randomness is deliberate: varied thematic suggestions per request.
const CHAT_TEMPERATURE: f64 = 1.0;

const RECEIPT_POLL_INTERVAL_SECONDS: f64 = 1.0;
const RECEIPT_POLL_TIMEOUT_SECONDS: f64 = 120.0;

/// Chat-completions client for the attribute-vocabulary suggestion turn.
pub struct ChatCompletionClient {
    api_base: String,
    api_key: Option<String>,
    http: HttpClient,
}

impl ChatCompletionClient {
    pub fn new() -> Self {
        Self::with_config(
            env::var("OPENAI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            non_empty_env("OPENAI_API_KEY"),
        )
    }

    pub fn with_config(api_base: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            api_base: api_base.into(),
            api_key,
            http: HttpClient::new(),
        }
    }

    fn completions_endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }

    /// Sends the full transcript and returns the first choice's content.
    pub fn complete(&self, model: &str, transcript: &Transcript) -> Result<String> {
        let Some(api_key) = self.api_key.as_deref() else {
            bail!("OPENAI_API_KEY not set");
        };

        let endpoint = self.completions_endpoint();
        let payload = json!({
            "model": model,
            "messages": transcript.to_payload(),
            "max_tokens": CHAT_MAX_TOKENS,
            "n": CHAT_RESPONSE_COUNT,
            "temperature": CHAT_TEMPERATURE,
        });
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .with_context(|| format!("chat completion request failed ({endpoint})"))?;
        let body = response_json_or_error("chat completion", response)?;

        let reply = body
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow::anyhow!("chat completion returned no message content"))?;
        Ok(reply.to_string())
    }
}

impl Default for ChatCompletionClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Client for the remote artwork generator endpoint.
pub struct GeneratorClient {
    api_base: String,
    http: HttpClient,
}

impl GeneratorClient {
    pub fn new() -> Self {
        Self::with_base(
            env::var("NOUNIFY_GENERATOR_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "http://31.12.82.146:14350".to_string()),
        )
    }

    pub fn with_base(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            http: HttpClient::new(),
        }
    }

    fn generate_endpoint(&self) -> String {
        format!("{}/generate", self.api_base)
    }

    /// Posts a payload body and returns the metadata URLs the generator
    /// responded with. A response without a `urls` key is an empty list,
    /// not an error.
    pub fn resolve_urls(&self, payload: &Value) -> Result<Vec<String>> {
        let endpoint = self.generate_endpoint();
        let response = self
            .http
            .post(&endpoint)
            .json(payload)
            .send()
            .with_context(|| format!("generator request failed ({endpoint})"))?;
        let body = response_json_or_error("generator", response)?;
        Ok(urls_from_response(&body))
    }
}

impl Default for GeneratorClient {
    fn default() -> Self {
        Self::new()
    }
}

fn urls_from_response(body: &Value) -> Vec<String> {
    body.get("urls")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// The body every generator request carries: the raw theme repeated under
/// each trait key. The chat-derived payload is recorded in the event log
/// but never sent; changing that coupling means changing this function and
/// the test that pins it.
pub fn generator_request_body(theme: &str) -> Value {
    AttributePayload::fallback(theme).to_request_body()
}

fn fetch_metadata(http: &HttpClient, url: &str) -> Result<NftMetadata> {
    let response = http
        .get(url)
        .send()
        .with_context(|| format!("metadata request failed ({url})"))?;
    if !response.status().is_success() {
        let code = response.status().as_u16();
        bail!("metadata request failed ({code}): {url}");
    }
    let body: Value = response
        .json()
        .with_context(|| format!("metadata body is not valid JSON ({url})"))?;
    Ok(NftMetadata::from_value(&body, url))
}

/// Fetches every URL on its own thread and joins in spawn order, so the
/// result order matches the input order. All-or-nothing: the first failure
/// fails the whole batch.
pub fn fetch_metadata_batch(http: &HttpClient, urls: &[String]) -> Result<Vec<NftMetadata>> {
    let mut handles = Vec::new();
    for url in urls {
        let http = http.clone();
        let url = url.clone();
        handles.push(thread::spawn(move || fetch_metadata(&http, &url)));
    }

    let mut records = Vec::new();
    let mut first_error: Option<anyhow::Error> = None;
    for handle in handles {
        match handle.join() {
            Ok(Ok(record)) => records.push(record),
            Ok(Err(err)) => {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
            Err(_) => {
                if first_error.is_none() {
                    first_error = Some(anyhow::anyhow!("metadata fetch worker panicked"));
                }
            }
        }
    }
    if let Some(err) = first_error {
        return Err(err);
    }
    Ok(records)
}

#[derive(Debug, Clone, PartialEq)]
pub struct MintReceipt {
    pub transaction_hash: String,
    pub block_hash: String,
    pub block_number: u64,
}

/// Narrow seam to the connected wallet and contract. The engine only ever
/// issues one write call through it.
pub trait MintGateway: Send + Sync {
    fn name(&self) -> &str;
    fn mint(&self, request: &MintRequest, confirmations: u64) -> Result<MintReceipt>;
}

/// Offline gateway with hash-derived receipts. Default when no RPC endpoint
/// is configured, and the seam the tests drive.
pub struct DryrunGateway;

impl MintGateway for DryrunGateway {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn mint(&self, request: &MintRequest, _confirmations: u64) -> Result<MintReceipt> {
        let transaction_hash = hash_hex(&["nounify-mint", &request.recipient, &request.uri]);
        let block_hash = hash_hex(&["nounify-block", &transaction_hash]);
        let block_number = u64::from_be_bytes(
            digest_of(&["nounify-height", &transaction_hash])[..8]
                .try_into()
                .unwrap_or([0; 8]),
        ) % 1_000_000;
        Ok(MintReceipt {
            transaction_hash,
            block_hash,
            block_number,
        })
    }
}

/// JSON-RPC 2.0 gateway: sends `safeMint(recipient, uri)` from the
/// recipient's own account on the node and polls the receipt until the
/// requested confirmation depth is reached.
pub struct JsonRpcGateway {
    rpc_url: String,
    contract: String,
    http: HttpClient,
}

impl JsonRpcGateway {
    pub fn new(rpc_url: impl Into<String>, contract: impl Into<String>) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            contract: contract.into(),
            http: HttpClient::new(),
        }
    }

    fn rpc_call(&self, method: &str, params: Value) -> Result<Value> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response = self
            .http
            .post(&self.rpc_url)
            .json(&payload)
            .send()
            .with_context(|| format!("rpc request failed ({method})"))?;
        let body = response_json_or_error("rpc", response)?;
        if let Some(error) = body.get("error").filter(|value| !value.is_null()) {
            bail!("rpc {method} returned an error: {error}");
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }

    fn wait_for_receipt(&self, tx_hash: &str, confirmations: u64) -> Result<MintReceipt> {
        let started = Instant::now();
        loop {
            let receipt = self.rpc_call("eth_getTransactionReceipt", json!([tx_hash]))?;
            if let Some(obj) = receipt.as_object() {
                let block_hash = obj
                    .get("blockHash")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| anyhow::anyhow!("transaction receipt missing blockHash"))?;
                let block_number = obj
                    .get("blockNumber")
                    .and_then(Value::as_str)
                    .map(parse_hex_quantity)
                    .transpose()?
                    .ok_or_else(|| anyhow::anyhow!("transaction receipt missing blockNumber"))?;
                let latest = parse_hex_quantity(
                    self.rpc_call("eth_blockNumber", json!([]))?
                        .as_str()
                        .unwrap_or_default(),
                )?;
                if latest.saturating_sub(block_number) + 1 >= confirmations.max(1) {
                    return Ok(MintReceipt {
                        transaction_hash: tx_hash.to_string(),
                        block_hash,
                        block_number,
                    });
                }
            }
            if started.elapsed().as_secs_f64() >= RECEIPT_POLL_TIMEOUT_SECONDS {
                bail!(
                    "receipt polling timed out after {:.1}s ({tx_hash})",
                    RECEIPT_POLL_TIMEOUT_SECONDS
                );
            }
            thread::sleep(Duration::from_secs_f64(RECEIPT_POLL_INTERVAL_SECONDS));
        }
    }
}

impl MintGateway for JsonRpcGateway {
    fn name(&self) -> &str {
        "json-rpc"
    }

    fn mint(&self, request: &MintRequest, confirmations: u64) -> Result<MintReceipt> {
        if request.recipient.trim().is_empty() {
            bail!("mint requires a connected wallet address");
        }
        let data = encode_safe_mint_call(&request.recipient, &request.uri)?;
        let transaction = json!({
            "from": request.recipient,
            "to": self.contract,
            "data": data,
        });
        let tx_hash = self
            .rpc_call("eth_sendTransaction", json!([transaction]))?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("eth_sendTransaction returned no transaction hash"))?;
        self.wait_for_receipt(&tx_hash, confirmations)
    }
}

// Four-byte selector for safeMint(address,string).
const SAFE_MINT_SELECTOR: [u8; 4] = [0xd2, 0x04, 0xc4, 0x5e];

/// ABI-encodes the `safeMint(address,string)` call as 0x-prefixed calldata:
/// selector, address word, offset word to the string tail, then the string
/// length word and its padded bytes.
pub fn encode_safe_mint_call(recipient: &str, uri: &str) -> Result<String> {
    let mut data = SAFE_MINT_SELECTOR.to_vec();
    data.extend_from_slice(&encode_address_word(recipient)?);
    data.extend_from_slice(&encode_quantity_word(64));
    data.extend_from_slice(&encode_quantity_word(uri.len() as u64));
    data.extend_from_slice(uri.as_bytes());
    let padding = (32 - uri.len() % 32) % 32;
    data.extend(std::iter::repeat(0u8).take(padding));
    Ok(format!("0x{}", hex::encode(data)))
}

fn encode_address_word(address: &str) -> Result<[u8; 32]> {
    let trimmed = address.trim();
    let stripped = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let bytes =
        hex::decode(stripped).with_context(|| format!("invalid wallet address ({trimmed})"))?;
    if bytes.len() != 20 {
        bail!(
            "wallet address must be 20 bytes, got {} ({trimmed})",
            bytes.len()
        );
    }
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(&bytes);
    Ok(word)
}

fn encode_quantity_word(value: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}

fn parse_hex_quantity(value: &str) -> Result<u64> {
    let trimmed = value.trim();
    let stripped = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if stripped.is_empty() {
        bail!("empty hex quantity");
    }
    u64::from_str_radix(stripped, 16).with_context(|| format!("invalid hex quantity ({trimmed})"))
}

/// Orchestrator for one session: owns the transcript, the session state,
/// the shared clients, and the wallet gateway, and emits an event at every
/// pipeline boundary.
pub struct StudioEngine {
    session_dir: PathBuf,
    session_id: String,
    events: EventWriter,
    transcript: Transcript,
    session: SessionState,
    chat: ChatCompletionClient,
    generator: GeneratorClient,
    metadata_http: HttpClient,
    gateway: Box<dyn MintGateway>,
    text_model: String,
    wallet: Option<String>,
    contract: Option<String>,
    confirmations: u64,
}

impl StudioEngine {
    pub fn new(
        session_dir: impl Into<PathBuf>,
        events_path: impl Into<PathBuf>,
        text_model: Option<String>,
        wallet: Option<String>,
        contract: Option<String>,
    ) -> Result<Self> {
        let session_dir = session_dir.into();
        std::fs::create_dir_all(&session_dir)?;
        let session_id = session_dir
            .file_name()
            .and_then(|value| value.to_str())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let events = EventWriter::new(events_path.into(), session_id.clone());

        let gateway: Box<dyn MintGateway> = match (non_empty_env("ETH_RPC_URL"), contract.as_deref())
        {
            (Some(rpc_url), Some(contract_address)) => {
                Box::new(JsonRpcGateway::new(rpc_url, contract_address))
            }
            _ => Box::new(DryrunGateway),
        };
        let text_model = text_model
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_TEXT_MODEL.to_string());

        events.emit(
            "session_started",
            map_object(json!({
                "out_dir": session_dir.to_string_lossy().to_string(),
                "text_model": text_model,
                "gateway": gateway.name(),
            })),
        )?;

        Ok(Self {
            session_dir,
            session_id,
            events,
            transcript: Transcript::new(),
            session: SessionState::new(),
            chat: ChatCompletionClient::new(),
            generator: GeneratorClient::new(),
            metadata_http: HttpClient::new(),
            gateway,
            text_model,
            wallet: wallet
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            contract,
            confirmations: DEFAULT_CONFIRMATIONS,
        })
    }

    pub fn with_gateway(mut self, gateway: Box<dyn MintGateway>) -> Self {
        self.gateway = gateway;
        self
    }

    pub fn with_chat_client(mut self, chat: ChatCompletionClient) -> Self {
        self.chat = chat;
        self
    }

    pub fn with_generator_client(mut self, generator: GeneratorClient) -> Self {
        self.generator = generator;
        self
    }

    pub fn session_dir(&self) -> &PathBuf {
        &self.session_dir
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn text_model(&self) -> &str {
        &self.text_model
    }

    pub fn set_text_model(&mut self, model: Option<String>) {
        if let Some(model) = model
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
        {
            self.text_model = model;
        }
    }

    pub fn wallet(&self) -> Option<&str> {
        self.wallet.as_deref()
    }

    pub fn set_wallet(&mut self, address: Option<String>) {
        self.wallet = address
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
    }

    pub fn contract(&self) -> Option<&str> {
        self.contract.as_deref()
    }

    pub fn confirmations(&self) -> u64 {
        self.confirmations
    }

    pub fn set_confirmations(&mut self, count: u64) {
        self.confirmations = count.max(1);
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn previews(&self) -> &[NftMetadata] {
        self.session.previews()
    }

    pub fn active_image(&self) -> Option<&str> {
        self.session.active_image()
    }

    pub fn emit_event(&self, event_type: &str, payload: EventPayload) -> Result<Value> {
        self.events.emit(event_type, payload)
    }

    pub fn event_writer(&self) -> EventWriter {
        self.events.clone()
    }

    /// Appends the theme as a user turn, asks the chat model for an
    /// attribute vocabulary, and appends the reply. The user turn lands on
    /// the transcript before any network traffic; a failed call leaves the
    /// transcript without an assistant turn.
    pub fn suggest_attributes(&mut self, theme: &str) -> Result<String> {
        self.transcript.push_user(theme);
        self.events.emit(
            "theme_submitted",
            map_object(json!({
                "theme": theme,
                "transcript_len": self.transcript.len(),
            })),
        )?;

        let reply = match self.chat.complete(&self.text_model, &self.transcript) {
            Ok(reply) => reply,
            Err(err) => {
                self.events.emit(
                    "suggestion_failed",
                    map_object(json!({
                        "theme": theme,
                        "error": format!("{err:#}"),
                    })),
                )?;
                return Err(err);
            }
        };
        self.transcript.push_assistant(reply.clone());

        match AttributePayload::parse(&reply) {
            Ok(payload) => {
                self.events.emit(
                    "attributes_suggested",
                    map_object(json!({
                        "theme": theme,
                        "payload": payload.to_request_body(),
                    })),
                )?;
            }
            Err(err) => {
                self.events.emit(
                    "attributes_unparsed",
                    map_object(json!({
                        "theme": theme,
                        "error": format!("{err:#}"),
                        "reply": reply,
                    })),
                )?;
            }
        }
        Ok(reply)
    }

    /// Asks the generator for candidate metadata URLs. The request body is
    /// always the synthesized fallback payload (see `generator_request_body`).
    pub fn resolve_image_urls(&self, theme: &str) -> Result<Vec<String>> {
        let body = generator_request_body(theme);
        match self.generator.resolve_urls(&body) {
            Ok(urls) => {
                self.events.emit(
                    "urls_resolved",
                    map_object(json!({
                        "theme": theme,
                        "count": urls.len(),
                    })),
                )?;
                Ok(urls)
            }
            Err(err) => {
                self.events.emit(
                    "resolution_failed",
                    map_object(json!({
                        "theme": theme,
                        "error": format!("{err:#}"),
                    })),
                )?;
                Err(err)
            }
        }
    }

    pub fn fetch_previews(&self, urls: &[String]) -> Result<Vec<NftMetadata>> {
        match fetch_metadata_batch(&self.metadata_http, urls) {
            Ok(records) => {
                self.events.emit(
                    "metadata_fetched",
                    map_object(json!({
                        "count": records.len(),
                    })),
                )?;
                Ok(records)
            }
            Err(err) => {
                self.events.emit(
                    "metadata_failed",
                    map_object(json!({
                        "count": urls.len(),
                        "error": format!("{err:#}"),
                    })),
                )?;
                Err(err)
            }
        }
    }

    pub fn begin_generation(&mut self) -> u64 {
        self.session.begin_generation()
    }

    /// Applies a finished run's previews unless a newer run has been issued
    /// since, in which case the results are dropped and logged.
    pub fn apply_previews(&mut self, token: u64, previews: Vec<NftMetadata>) -> Result<bool> {
        let count = previews.len();
        if self.session.apply_previews(token, previews) {
            self.events.emit(
                "previews_updated",
                map_object(json!({
                    "token": token,
                    "count": count,
                })),
            )?;
            return Ok(true);
        }
        self.events.emit(
            "previews_stale_dropped",
            map_object(json!({
                "token": token,
                "latest": self.session.latest_generation(),
                "count": count,
            })),
        )?;
        Ok(false)
    }

    /// One full generation run: suggestion turn, URL resolution, metadata
    /// fetch, then a token-guarded preview update. The suggestion is
    /// advisory — its failure does not abort the run — while resolver and
    /// fetch failures do, leaving any prior previews untouched.
    pub fn generate(&mut self, theme: &str) -> Result<Vec<NftMetadata>> {
        let token = self.session.begin_generation();
        let _ = self.suggest_attributes(theme);
        let urls = self.resolve_image_urls(theme)?;
        let previews = self.fetch_previews(&urls)?;
        self.apply_previews(token, previews)?;
        Ok(self.session.previews().to_vec())
    }

    pub fn select(&mut self, image_url: &str) -> Result<()> {
        self.session.select(image_url);
        let matched = self.session.selected().is_some();
        self.events.emit(
            "image_selected",
            map_object(json!({
                "image": image_url,
                "matches_preview": matched,
            })),
        )?;
        Ok(())
    }

    /// Performs the single contract write for the current selection and
    /// waits for the configured confirmation depth. An unmatched selection
    /// mints with an empty URI; that constraint belongs to the contract.
    pub fn mint(&mut self) -> Result<MintReceipt> {
        let Some(wallet) = self.wallet.clone() else {
            bail!("no wallet address configured");
        };
        let request = self.session.mint_request(&wallet);
        self.events.emit(
            "mint_submitted",
            map_object(json!({
                "recipient": request.recipient,
                "uri": request.uri,
                "gateway": self.gateway.name(),
                "confirmations": self.confirmations,
            })),
        )?;

        match self.gateway.mint(&request, self.confirmations) {
            Ok(receipt) => {
                self.events.emit(
                    "mint_confirmed",
                    map_object(json!({
                        "transaction_hash": receipt.transaction_hash,
                        "block_hash": receipt.block_hash,
                        "block_number": receipt.block_number,
                    })),
                )?;
                Ok(receipt)
            }
            Err(err) => {
                self.events.emit(
                    "mint_failed",
                    map_object(json!({
                        "recipient": request.recipient,
                        "uri": request.uri,
                        "error": format!("{err:#}"),
                    })),
                )?;
                Err(err)
            }
        }
    }

    pub fn finish(&mut self) -> Result<()> {
        self.events.emit(
            "session_finished",
            map_object(json!({
                "generations": self.session.latest_generation(),
                "previews": self.session.previews().len(),
                "transcript_len": self.transcript.len(),
            })),
        )?;
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn response_json_or_error(label: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{label} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{label} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{label} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn digest_of(parts: &[&str]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hasher.finalize().into()
}

fn hash_hex(parts: &[&str]) -> String {
    format!("0x{}", hex::encode(digest_of(parts)))
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::Mutex;
    use std::thread;

    use nounify_core::chat::{ChatRole, Transcript};
    use nounify_core::session::MintRequest;
    use reqwest::blocking::Client as HttpClient;
    use serde_json::{json, Value};

    use super::{
        encode_safe_mint_call, fetch_metadata_batch, generator_request_body, parse_hex_quantity,
        urls_from_response, ChatCompletionClient, DryrunGateway, MintGateway, MintReceipt,
        StudioEngine,
    };

    fn test_engine(dir: &std::path::Path) -> StudioEngine {
        StudioEngine::new(
            dir.join("session"),
            dir.join("events.jsonl"),
            Some("test-model".to_string()),
            Some("0x00a329c0648769a73afac7f9381e08fb43dbea72".to_string()),
            None,
        )
        .unwrap()
        .with_gateway(Box::new(DryrunGateway))
        .with_chat_client(ChatCompletionClient::with_config("http://127.0.0.1:1", None))
    }

    fn events_of_type(dir: &std::path::Path, event_type: &str) -> Vec<Value> {
        let content = std::fs::read_to_string(dir.join("events.jsonl")).unwrap_or_default();
        content
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter(|event| event["type"] == json!(event_type))
            .collect()
    }

    /// One-shot HTTP fixture: serves each queued (status, body) response to
    /// one incoming request, in connection order. The request body is
    /// drained before responding so the peer never sees a reset.
    fn serve_responses(responses: Vec<(u16, String)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test listener");
        let address = listener.local_addr().expect("listener address");
        thread::spawn(move || {
            for (status, body) in responses {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
                let mut line = String::new();
                let mut content_length = 0usize;
                while reader.read_line(&mut line).unwrap_or(0) > 0 {
                    if line == "\r\n" || line == "\n" {
                        break;
                    }
                    if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                        content_length = value.trim().parse().unwrap_or(0);
                    }
                    line.clear();
                }
                if content_length > 0 {
                    let mut request_body = vec![0u8; content_length];
                    let _ = std::io::Read::read_exact(&mut reader, &mut request_body);
                }
                let reason = if status == 200 { "OK" } else { "ERROR" };
                let response = format!(
                    "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{address}")
    }

    struct RecordingGateway {
        last: Mutex<Option<MintRequest>>,
    }

    impl MintGateway for RecordingGateway {
        fn name(&self) -> &str {
            "recording"
        }

        fn mint(&self, request: &MintRequest, _confirmations: u64) -> anyhow::Result<MintReceipt> {
            *self.last.lock().unwrap() = Some(request.clone());
            Ok(MintReceipt {
                transaction_hash: "0xtx".to_string(),
                block_hash: "0xblock".to_string(),
                block_number: 1,
            })
        }
    }

    #[test]
    fn suggestion_appends_user_turn_before_any_network_call() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut engine = test_engine(temp.path());

        // No API key: the chat client bails before issuing a request.
        let result = engine.suggest_attributes("ocean theme");
        assert!(result.is_err());

        let roles: Vec<ChatRole> = engine
            .transcript()
            .messages()
            .iter()
            .map(|message| message.role)
            .collect();
        assert_eq!(roles, vec![ChatRole::System, ChatRole::User]);
        assert_eq!(
            engine.transcript().last().map(|m| m.content.as_str()),
            Some("ocean theme")
        );
        assert_eq!(events_of_type(temp.path(), "suggestion_failed").len(), 1);
        Ok(())
    }

    #[test]
    fn generator_body_ignores_chat_suggestions() {
        // Pinned coupling: the request body derives from the raw theme
        // alone, never from the assistant payload.
        assert_eq!(
            generator_request_body("ocean theme"),
            json!({
                "head": ["ocean theme"],
                "glasses": ["ocean theme"],
                "body": ["ocean theme"],
                "accessories": ["ocean theme"],
            })
        );
    }

    #[test]
    fn response_without_urls_key_is_an_empty_list() {
        assert!(urls_from_response(&json!({"status": "ok"})).is_empty());
        assert_eq!(
            urls_from_response(&json!({"urls": ["http://x/1.json", "", 7, "http://x/2.json"]})),
            vec!["http://x/1.json", "http://x/2.json"]
        );
    }

    #[test]
    fn metadata_batch_preserves_input_order() -> anyhow::Result<()> {
        let first = serve_responses(vec![(
            200,
            json!({"name": "Noun #1", "image": "http://x/1.png"}).to_string(),
        )]);
        let second = serve_responses(vec![(
            200,
            json!({"name": "Noun #2", "image": "http://x/2.png"}).to_string(),
        )]);

        let urls = vec![format!("{first}/1.json"), format!("{second}/2.json")];
        let records = fetch_metadata_batch(&HttpClient::new(), &urls)?;

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "Noun #1");
        assert_eq!(records[1].name, "Noun #2");
        assert_eq!(records[0].uri, urls[0]);
        assert_eq!(records[1].uri, urls[1]);
        Ok(())
    }

    #[test]
    fn metadata_batch_fails_as_a_whole() {
        let good = serve_responses(vec![(
            200,
            json!({"name": "Noun #1", "image": "http://x/1.png"}).to_string(),
        )]);
        let bad = serve_responses(vec![(500, "{}".to_string())]);

        let urls = vec![format!("{good}/1.json"), format!("{bad}/2.json")];
        assert!(fetch_metadata_batch(&HttpClient::new(), &urls).is_err());
    }

    #[test]
    fn generation_pipeline_yields_previews_in_input_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;

        let meta_one = serve_responses(vec![(
            200,
            json!({"name": "Ocean #1", "image": "http://x/1.png"}).to_string(),
        )]);
        let meta_two = serve_responses(vec![(
            200,
            json!({"name": "Ocean #2", "image": "http://x/2.png"}).to_string(),
        )]);
        let generator = serve_responses(vec![(
            200,
            json!({"urls": [format!("{meta_one}/1.json"), format!("{meta_two}/2.json")]})
                .to_string(),
        )]);
        let chat = serve_responses(vec![(
            200,
            json!({"choices": [{"message": {"content": "{\"head\": [\"coral\"]}"}}]}).to_string(),
        )]);

        let mut engine = test_engine(temp.path())
            .with_chat_client(ChatCompletionClient::with_config(
                chat,
                Some("test-key".to_string()),
            ))
            .with_generator_client(super::GeneratorClient::with_base(generator));

        let previews = engine.generate("ocean theme")?;
        assert_eq!(previews.len(), 2);
        assert_eq!(previews[0].name, "Ocean #1");
        assert_eq!(previews[1].name, "Ocean #2");

        // The suggestion turn landed on the transcript and in the log even
        // though the generator request carried the synthesized payload.
        assert_eq!(engine.transcript().len(), 3);
        assert_eq!(events_of_type(temp.path(), "attributes_suggested").len(), 1);
        assert_eq!(events_of_type(temp.path(), "previews_updated").len(), 1);
        Ok(())
    }

    #[test]
    fn generation_failure_leaves_previous_previews_untouched() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut engine = test_engine(temp.path());

        let token = engine.begin_generation();
        let record = nounify_core::metadata::NftMetadata::from_value(
            &json!({"name": "Noun #1", "image": "http://x/1.png"}),
            "http://x/1.json",
        );
        engine.apply_previews(token, vec![record])?;

        // Generator unreachable: the run fails at resolution.
        let mut engine =
            engine.with_generator_client(super::GeneratorClient::with_base("http://127.0.0.1:1"));
        assert!(engine.generate("desert theme").is_err());
        assert_eq!(engine.previews().len(), 1);
        assert_eq!(engine.previews()[0].name, "Noun #1");
        assert_eq!(events_of_type(temp.path(), "resolution_failed").len(), 1);
        Ok(())
    }

    #[test]
    fn stale_generation_results_are_dropped_and_logged() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut engine = test_engine(temp.path());

        let stale = engine.begin_generation();
        let latest = engine.begin_generation();

        let record = nounify_core::metadata::NftMetadata::from_value(
            &json!({"name": "Noun #1", "image": "http://x/1.png"}),
            "http://x/1.json",
        );
        assert!(!engine.apply_previews(stale, vec![record.clone()])?);
        assert!(engine.previews().is_empty());
        assert!(engine.apply_previews(latest, vec![record])?);
        assert_eq!(engine.previews().len(), 1);

        assert_eq!(
            events_of_type(temp.path(), "previews_stale_dropped").len(),
            1
        );
        assert_eq!(events_of_type(temp.path(), "previews_updated").len(), 1);
        Ok(())
    }

    #[test]
    fn mint_without_selection_sends_empty_uri() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut engine = StudioEngine::new(
            temp.path().join("session"),
            temp.path().join("events.jsonl"),
            None,
            Some("0x00a329c0648769a73afac7f9381e08fb43dbea72".to_string()),
            None,
        )?
        .with_gateway(Box::new(RecordingGateway {
            last: Mutex::new(None),
        }));
        let receipt = engine.mint()?;
        assert_eq!(receipt.transaction_hash, "0xtx");

        let submitted = events_of_type(temp.path(), "mint_submitted");
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0]["uri"], json!(""));
        Ok(())
    }

    #[test]
    fn selection_and_mint_use_the_matching_metadata_uri() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut engine = test_engine(temp.path());

        let token = engine.begin_generation();
        let records = vec![
            nounify_core::metadata::NftMetadata::from_value(
                &json!({"name": "Noun #1", "image": "http://x/1.png"}),
                "http://x/1.json",
            ),
            nounify_core::metadata::NftMetadata::from_value(
                &json!({"name": "Noun #2", "image": "http://x/2.png"}),
                "http://x/2.json",
            ),
        ];
        engine.apply_previews(token, records)?;
        engine.select("http://x/2.png")?;
        engine.select("http://x/2.png")?;
        assert_eq!(engine.active_image(), Some("http://x/2.png"));

        engine.mint()?;
        let submitted = events_of_type(temp.path(), "mint_submitted");
        assert_eq!(submitted[0]["uri"], json!("http://x/2.json"));
        Ok(())
    }

    #[test]
    fn dryrun_gateway_receipts_are_deterministic() -> anyhow::Result<()> {
        let request = MintRequest {
            recipient: "0x00a329c0648769a73afac7f9381e08fb43dbea72".to_string(),
            uri: "http://x/1.json".to_string(),
        };
        let first = DryrunGateway.mint(&request, 1)?;
        let second = DryrunGateway.mint(&request, 1)?;
        assert_eq!(first, second);
        assert!(first.transaction_hash.starts_with("0x"));
        assert_eq!(first.transaction_hash.len(), 66);
        assert_ne!(first.transaction_hash, first.block_hash);

        let other = DryrunGateway.mint(
            &MintRequest {
                recipient: request.recipient.clone(),
                uri: "http://x/2.json".to_string(),
            },
            1,
        )?;
        assert_ne!(other.transaction_hash, first.transaction_hash);
        Ok(())
    }

    #[test]
    fn safe_mint_calldata_layout() -> anyhow::Result<()> {
        let data = encode_safe_mint_call(
            "0x00a329c0648769a73afac7f9381e08fb43dbea72",
            "http://x/1.json",
        )?;
        let expected = concat!(
            "0x",
            "d204c45e",
            "00000000000000000000000000a329c0648769a73afac7f9381e08fb43dbea72",
            "0000000000000000000000000000000000000000000000000000000000000040",
            "000000000000000000000000000000000000000000000000000000000000000f",
            "687474703a2f2f782f312e6a736f6e0000000000000000000000000000000000",
        );
        assert_eq!(data, expected);
        Ok(())
    }

    #[test]
    fn safe_mint_rejects_malformed_addresses() {
        assert!(encode_safe_mint_call("0x1234", "uri").is_err());
        assert!(encode_safe_mint_call("not-hex", "uri").is_err());
    }

    #[test]
    fn hex_quantities_parse_with_and_without_prefix() -> anyhow::Result<()> {
        assert_eq!(parse_hex_quantity("0x10")?, 16);
        assert_eq!(parse_hex_quantity("ff")?, 255);
        assert!(parse_hex_quantity("0x").is_err());
        assert!(parse_hex_quantity("zz").is_err());
        Ok(())
    }

    #[test]
    fn chat_client_without_key_fails_before_sending() {
        let client = ChatCompletionClient::with_config("http://127.0.0.1:1", None);
        let err = client
            .complete("test-model", &Transcript::with_system("sys"))
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert!(err.contains("OPENAI_API_KEY"));
    }
}
