//! Ethereum JSON-RPC adapter for the squares contract.
//!
//! Views go through `eth_call`, writes through `eth_sendTransaction` from an account
//! the node manages (a local dev node, or a signer proxy in front of the player's
//! wallet). The full ownership table is fetched as one JSON-RPC batch pinned to a
//! single block, so every square is read from the same chain state.

use crate::{
    error::{
        LedgerError,
        LedgerResult,
    },
    ledger::{
        LedgerCall,
        LedgerEvent,
        LedgerLog,
        Receipt,
        ReceiptStatus,
        RemoteLedger,
        WalletSession,
    },
    types::{
        Address,
        Amount,
        GRID_SIZE,
        SquareIndex,
        TxId,
    },
};
use futures::{
    StreamExt,
    stream::BoxStream,
};
use serde::{
    Deserialize,
    de::DeserializeOwned,
};
use serde_json::{
    Value,
    json,
};
use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    sync::{
        Arc,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
    time::Duration,
};
use tracing::{
    debug,
    warn,
};

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const LOG_POLL_INTERVAL: Duration = Duration::from_secs(4);
const USER_REJECTED_CODE: i64 = 4001;
const EXECUTION_REVERTED_CODE: i64 = 3;

mod abi {
    use super::*;

    pub const ENTRY_PRICE: [u8; 4] = [0xf7, 0x45, 0xad, 0xfc];
    pub const GAME_STARTED: [u8; 4] = [0x5e, 0x12, 0x3c, 0xe4];
    pub const GAME_ENDED: [u8; 4] = [0x2f, 0x6f, 0xe3, 0x96];
    pub const HOME_SCORE_LAST_DIGIT: [u8; 4] = [0xf5, 0x82, 0xf7, 0xf6];
    pub const AWAY_SCORE_LAST_DIGIT: [u8; 4] = [0x46, 0x7f, 0xdb, 0x2b];
    pub const OWNER: [u8; 4] = [0x8d, 0xa5, 0xcb, 0x5b];
    pub const SQUARES: [u8; 4] = [0x1d, 0x1d, 0x15, 0xd4];
    pub const GET_MY_SQUARES: [u8; 4] = [0x80, 0xfb, 0xdc, 0x44];
    pub const BUY_SQUARE: [u8; 4] = [0xaa, 0x1e, 0x71, 0x63];
    pub const START_GAME: [u8; 4] = [0xd6, 0x5a, 0xb5, 0xf2];
    pub const END_GAME: [u8; 4] = [0x9f, 0x98, 0x98, 0x5d];
    pub const FORCE_RESET: [u8; 4] = [0x8b, 0x68, 0x0c, 0xc3];
    pub const RESET_GAME: [u8; 4] = [0xbb, 0x47, 0x22, 0x19];
    pub const ERROR_STRING: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];

    pub const SQUARE_PURCHASED_TOPIC: &str =
        "0xcb3ae07b6b09991dca71a3d5944d5b2c601fe20debdb76da22ae5995e4be419d";
    pub const GAME_STARTED_TOPIC: &str =
        "0x762f260439bb4be3ef6e4dc2786e2e7bd187d3d80b79057d7a424fe98563e335";
    pub const GAME_ENDED_TOPIC: &str =
        "0x1d3b18309fcd7be02b3cb02a6b2eebf55bdc38f582585bbad82e449da17fe810";

    pub type Word = [u8; 32];

    pub fn uint(value: u64) -> Word {
        let mut word = [0u8; 32];
        word[24..].copy_from_slice(&value.to_be_bytes());
        word
    }

    pub fn address(value: &Address) -> Word {
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(value.as_bytes());
        word
    }

    pub fn calldata(selector: [u8; 4], args: &[Word]) -> String {
        let mut bytes = selector.to_vec();
        for arg in args {
            bytes.extend_from_slice(arg);
        }
        format!("0x{}", hex::encode(bytes))
    }

    pub fn encode_call(call: &LedgerCall) -> String {
        match call {
            LedgerCall::BuySquare { index, .. } => {
                calldata(BUY_SQUARE, &[uint(u64::from(index.get()))])
            }
            LedgerCall::StartGame => calldata(START_GAME, &[]),
            LedgerCall::EndGame {
                home_score,
                away_score,
            } => calldata(
                END_GAME,
                &[uint(u64::from(*home_score)), uint(u64::from(*away_score))],
            ),
            LedgerCall::ForceReset => calldata(FORCE_RESET, &[]),
            LedgerCall::ResetGame => calldata(RESET_GAME, &[]),
        }
    }

    pub fn decode_hex(raw: &str) -> LedgerResult<Vec<u8>> {
        hex::decode(raw.trim_start_matches("0x"))
            .map_err(|e| LedgerError::Decode(format!("invalid hex '{raw}': {e}")))
    }

    pub fn words(bytes: &[u8]) -> Vec<Word> {
        bytes
            .chunks_exact(32)
            .filter_map(|chunk| chunk.try_into().ok())
            .collect()
    }

    pub fn word_at(bytes: &[u8], index: usize) -> LedgerResult<Word> {
        let too_short = || LedgerError::Decode(format!("return data too short for word {index}"));
        let start = index.checked_mul(32).ok_or_else(too_short)?;
        let end = start.checked_add(32).ok_or_else(too_short)?;
        bytes
            .get(start..end)
            .and_then(|slice| slice.try_into().ok())
            .ok_or_else(too_short)
    }

    pub fn as_u128(word: &Word) -> LedgerResult<u128> {
        if word[..16].iter().any(|b| *b != 0) {
            return Err(LedgerError::Decode("uint256 does not fit in u128".into()));
        }
        let mut low = [0u8; 16];
        low.copy_from_slice(&word[16..]);
        Ok(u128::from_be_bytes(low))
    }

    pub fn as_u64(word: &Word) -> LedgerResult<u64> {
        u64::try_from(as_u128(word)?)
            .map_err(|_| LedgerError::Decode("uint256 does not fit in u64".into()))
    }

    pub fn as_u32(word: &Word) -> LedgerResult<u32> {
        u32::try_from(as_u64(word)?)
            .map_err(|_| LedgerError::Decode("uint256 does not fit in u32".into()))
    }

    pub fn as_bool(word: &Word) -> LedgerResult<bool> {
        match as_u128(word)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(LedgerError::Decode(format!("invalid bool {other}"))),
        }
    }

    pub fn as_address(word: &Word) -> Address {
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&word[12..]);
        Address::new(bytes)
    }

    fn as_usize(word: &Word) -> LedgerResult<usize> {
        usize::try_from(as_u64(word)?)
            .map_err(|_| LedgerError::Decode("uint256 does not fit in usize".into()))
    }

    pub fn as_uint_array(bytes: &[u8]) -> LedgerResult<Vec<u64>> {
        let start = as_usize(&word_at(bytes, 0)?)? / 32;
        let len = as_usize(&word_at(bytes, start)?)?;
        (0..len)
            .map(|i| {
                let index = start
                    .checked_add(1)
                    .and_then(|first| first.checked_add(i))
                    .ok_or_else(|| LedgerError::Decode("array index overflow".into()))?;
                as_u64(&word_at(bytes, index)?)
            })
            .collect()
    }

    /// Reason string from `Error(string)` revert data, if that is what it holds.
    pub fn revert_reason(data: &[u8]) -> Option<String> {
        let payload = data.strip_prefix(&ERROR_STRING)?;
        let offset = as_usize(&word_at(payload, 0).ok()?).ok()?;
        let len = as_usize(&word_at(payload, offset / 32).ok()?).ok()?;
        let start = offset.checked_add(32)?;
        let raw = payload.get(start..start.checked_add(len)?)?;
        String::from_utf8(raw.to_vec()).ok()
    }
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

impl RpcResponse {
    fn into_result(self) -> LedgerResult<Value> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(classify_rpc_error(&error)),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

fn classify_rpc_error(error: &RpcErrorObject) -> LedgerError {
    let message = error.message.to_lowercase();
    if error.code == USER_REJECTED_CODE || message.contains("user rejected") {
        return LedgerError::UserDeclined;
    }
    if message.contains("insufficient funds") {
        return LedgerError::InsufficientFunds(error.message.clone());
    }
    if error.code == EXECUTION_REVERTED_CODE || message.contains("revert") {
        let reason = error
            .data
            .as_ref()
            .and_then(Value::as_str)
            .and_then(|raw| abi::decode_hex(raw).ok())
            .and_then(|data| abi::revert_reason(&data))
            .unwrap_or_else(|| {
                error
                    .message
                    .trim_start_matches("execution reverted")
                    .trim_start_matches(':')
                    .trim()
                    .to_string()
            });
        return LedgerError::Reverted(reason);
    }
    LedgerError::Transport(format!("rpc error {}: {}", error.code, error.message))
}

fn classify_http_error(err: reqwest::Error) -> LedgerError {
    if err.is_timeout() {
        LedgerError::Timeout
    } else {
        LedgerError::Transport(err.to_string())
    }
}

fn parse_quantity(value: &Value) -> LedgerResult<u128> {
    let raw = value
        .as_str()
        .ok_or_else(|| LedgerError::Decode(format!("expected hex quantity, got {value}")))?;
    u128::from_str_radix(raw.trim_start_matches("0x"), 16)
        .map_err(|e| LedgerError::Decode(format!("invalid quantity '{raw}': {e}")))
}

fn parse_u64_quantity(value: &Value) -> LedgerResult<u64> {
    u64::try_from(parse_quantity(value)?)
        .map_err(|_| LedgerError::Decode(format!("quantity {value} does not fit in u64")))
}

/// Polls `fetch` until it returns a non-null receipt. The transaction is already
/// broadcast, so transport failures are retried; the caller bounds the wait.
async fn poll_until_mined<F, Fut>(tx: TxId, mut fetch: F) -> LedgerResult<Value>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LedgerResult<Value>>,
{
    loop {
        match fetch().await {
            Ok(value) if !value.is_null() => return Ok(value),
            Ok(_) => {}
            Err(err @ (LedgerError::Transport(_) | LedgerError::Timeout)) => {
                warn!(%tx, ?err, "receipt poll failed, retrying");
            }
            Err(err) => return Err(err),
        }
        tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
    }
}

fn parse_json<T: DeserializeOwned>(value: Value) -> LedgerResult<T> {
    serde_json::from_value(value)
        .map_err(|e| LedgerError::Decode(format!("unexpected rpc payload: {e}")))
}

/// HTTP plumbing shared by the ledger, the wallet and the log stream.
#[derive(Clone)]
struct RpcTransport {
    url: String,
    http: reqwest::Client,
    next_id: Arc<AtomicU64>,
}

impl RpcTransport {
    fn new(url: impl Into<String>, request_timeout: Duration) -> LedgerResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| LedgerError::Transport(format!("failed to build http client: {e}")))?;
        Ok(Self {
            url: url.into(),
            http,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    fn envelope(&self, method: &str, params: Value) -> (u64, Value) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        (id, body)
    }

    async fn post<T: DeserializeOwned>(&self, body: &Value) -> LedgerResult<T> {
        let res = self
            .http
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(classify_http_error)?;
        let status = res.status();
        if !status.is_success() {
            let text = res
                .text()
                .await
                .unwrap_or_else(|_| "<unavailable body>".to_string());
            return Err(LedgerError::Transport(format!(
                "rpc endpoint responded with {status}: {text}"
            )));
        }
        res.json().await.map_err(classify_http_error)
    }

    async fn request(&self, method: &str, params: Value) -> LedgerResult<Value> {
        let (_, body) = self.envelope(method, params);
        debug!(method, "rpc request");
        let response: RpcResponse = self.post(&body).await?;
        response.into_result()
    }

    /// Sends every request in one HTTP round-trip and returns results in input order.
    async fn batch(&self, requests: Vec<(&str, Value)>) -> LedgerResult<Vec<Value>> {
        let (ids, bodies): (Vec<u64>, Vec<Value>) = requests
            .into_iter()
            .map(|(method, params)| self.envelope(method, params))
            .unzip();
        debug!(size = bodies.len(), "rpc batch request");
        let responses: Vec<RpcResponse> = self.post(&Value::Array(bodies)).await?;
        if responses.len() != ids.len() {
            return Err(LedgerError::Decode(format!(
                "batch returned {} responses for {} requests",
                responses.len(),
                ids.len()
            )));
        }
        let mut by_id: HashMap<u64, RpcResponse> = responses
            .into_iter()
            .map(|response| (response.id, response))
            .collect();
        ids.iter()
            .map(|id| {
                by_id
                    .remove(id)
                    .ok_or_else(|| LedgerError::Decode(format!("missing batch response {id}")))?
                    .into_result()
            })
            .collect()
    }

    async fn block_number(&self) -> LedgerResult<u64> {
        let value = self.request("eth_blockNumber", json!([])).await?;
        parse_u64_quantity(&value)
    }
}

pub struct RpcLedger {
    transport: RpcTransport,
    contract: Address,
}

impl RpcLedger {
    pub fn new(
        url: impl Into<String>,
        contract: Address,
        request_timeout: Duration,
    ) -> LedgerResult<Self> {
        Ok(Self {
            transport: RpcTransport::new(url, request_timeout)?,
            contract,
        })
    }

    fn call_params(&self, data: String, block: &str) -> Value {
        json!([{ "to": self.contract.to_string(), "data": data }, block])
    }

    async fn view(&self, selector: [u8; 4], args: &[abi::Word]) -> LedgerResult<Vec<u8>> {
        let params = self.call_params(abi::calldata(selector, args), "latest");
        let value = self.transport.request("eth_call", params).await?;
        let raw = value
            .as_str()
            .ok_or_else(|| LedgerError::Decode("eth_call returned no data".into()))?;
        abi::decode_hex(raw)
    }

    async fn view_word(&self, selector: [u8; 4]) -> LedgerResult<abi::Word> {
        let data = self.view(selector, &[]).await?;
        abi::word_at(&data, 0)
    }

    /// Re-runs a failed transaction as a call to recover its revert reason.
    async fn replay_revert_reason(&self, tx: TxId, block_number: u64) -> Option<String> {
        let original = self
            .transport
            .request("eth_getTransactionByHash", json!([tx.to_string()]))
            .await
            .ok()?;
        let from = original.get("from")?.clone();
        let to = original.get("to")?.clone();
        let input = original.get("input")?.clone();
        let value = original.get("value")?.clone();
        let block = format!("{:#x}", block_number.saturating_sub(1));
        let params = json!([{ "from": from, "to": to, "data": input, "value": value }, block]);
        match self.transport.request("eth_call", params).await {
            Err(LedgerError::Reverted(reason)) => Some(reason),
            _ => None,
        }
    }
}

impl RemoteLedger for RpcLedger {
    async fn entry_price(&self) -> LedgerResult<Amount> {
        let word = self.view_word(abi::ENTRY_PRICE).await?;
        Ok(Amount::from_wei(abi::as_u128(&word)?))
    }

    async fn game_started(&self) -> LedgerResult<bool> {
        abi::as_bool(&self.view_word(abi::GAME_STARTED).await?)
    }

    async fn game_ended(&self) -> LedgerResult<bool> {
        abi::as_bool(&self.view_word(abi::GAME_ENDED).await?)
    }

    async fn home_score_last_digit(&self) -> LedgerResult<u64> {
        abi::as_u64(&self.view_word(abi::HOME_SCORE_LAST_DIGIT).await?)
    }

    async fn away_score_last_digit(&self) -> LedgerResult<u64> {
        abi::as_u64(&self.view_word(abi::AWAY_SCORE_LAST_DIGIT).await?)
    }

    async fn owner(&self) -> LedgerResult<Address> {
        Ok(abi::as_address(&self.view_word(abi::OWNER).await?))
    }

    async fn squares(&self) -> LedgerResult<Vec<Option<Address>>> {
        let block = format!("{:#x}", self.transport.block_number().await?);
        let requests = SquareIndex::all()
            .map(|index| {
                let data =
                    abi::calldata(abi::SQUARES, &[abi::uint(u64::from(index.get()))]);
                ("eth_call", self.call_params(data, &block))
            })
            .collect();
        let results = self.transport.batch(requests).await?;
        if results.len() != GRID_SIZE {
            return Err(LedgerError::Decode(format!(
                "expected {GRID_SIZE} squares, got {}",
                results.len()
            )));
        }
        results
            .iter()
            .map(|value| {
                let raw = value
                    .as_str()
                    .ok_or_else(|| LedgerError::Decode("squares returned no data".into()))?;
                let player = abi::as_address(&abi::word_at(&abi::decode_hex(raw)?, 0)?);
                Ok((!player.is_zero()).then_some(player))
            })
            .collect()
    }

    async fn my_squares(&self, player: Address) -> LedgerResult<Vec<SquareIndex>> {
        let data = self
            .view(abi::GET_MY_SQUARES, &[abi::address(&player)])
            .await?;
        abi::as_uint_array(&data)?
            .into_iter()
            .map(|raw| {
                u8::try_from(raw)
                    .ok()
                    .and_then(SquareIndex::new)
                    .ok_or_else(|| LedgerError::Decode(format!("square index {raw} out of range")))
            })
            .collect()
    }

    async fn send(&self, from: Address, call: LedgerCall) -> LedgerResult<TxId> {
        let params = json!([{
            "from": from.to_string(),
            "to": self.contract.to_string(),
            "data": abi::encode_call(&call),
            "value": format!("{:#x}", call.value().wei()),
        }]);
        let value = self.transport.request("eth_sendTransaction", params).await?;
        let raw = value
            .as_str()
            .ok_or_else(|| LedgerError::Decode("eth_sendTransaction returned no hash".into()))?;
        raw.parse()
            .map_err(|e| LedgerError::Decode(format!("invalid transaction hash: {e}")))
    }

    async fn wait_for_receipt(&self, tx: TxId) -> LedgerResult<Receipt> {
        let value = poll_until_mined(tx, || {
            self.transport
                .request("eth_getTransactionReceipt", json!([tx.to_string()]))
        })
        .await?;
        let block_number = value
            .get("blockNumber")
            .map(parse_u64_quantity)
            .transpose()?
            .unwrap_or_default();
        let success = value
            .get("status")
            .map(parse_quantity)
            .transpose()?
            .is_some_and(|status| status == 1);
        let status = if success {
            ReceiptStatus::Success
        } else {
            let reason = self
                .replay_revert_reason(tx, block_number)
                .await
                .unwrap_or_else(|| "transaction reverted".to_string());
            ReceiptStatus::Reverted(reason)
        };
        Ok(Receipt {
            tx,
            block_number,
            status,
        })
    }

    fn subscribe(&self) -> BoxStream<'static, LedgerResult<LedgerLog>> {
        let state = LogPoller {
            transport: self.transport.clone(),
            contract: self.contract,
            next_block: None,
            buffer: VecDeque::new(),
        };
        futures::stream::unfold(state, |mut state| async move {
            let item = state.next().await;
            Some((item, state))
        })
        .boxed()
    }
}

struct LogPoller {
    transport: RpcTransport,
    contract: Address,
    next_block: Option<u64>,
    buffer: VecDeque<LedgerLog>,
}

#[derive(Deserialize)]
struct RawLog {
    topics: Vec<String>,
    data: String,
    #[serde(rename = "transactionHash")]
    transaction_hash: Option<String>,
}

impl LogPoller {
    async fn next(&mut self) -> LedgerResult<LedgerLog> {
        loop {
            if let Some(log) = self.buffer.pop_front() {
                return Ok(log);
            }
            tokio::time::sleep(LOG_POLL_INTERVAL).await;
            let head = self.transport.block_number().await?;
            let from = match self.next_block {
                Some(from) if from <= head => from,
                Some(_) => continue,
                None => {
                    // only events from blocks after the subscription started
                    self.next_block = Some(head + 1);
                    continue;
                }
            };
            let params = json!([{
                "address": self.contract.to_string(),
                "fromBlock": format!("{from:#x}"),
                "toBlock": format!("{head:#x}"),
            }]);
            let logs: Vec<RawLog> =
                parse_json(self.transport.request("eth_getLogs", params).await?)?;
            self.next_block = Some(head + 1);
            for raw in logs {
                match decode_log(&raw) {
                    Ok(Some(log)) => self.buffer.push_back(log),
                    Ok(None) => {}
                    Err(err) => warn!(?err, "skipping undecodable contract log"),
                }
            }
        }
    }
}

/// Indexed parameters are assumed to be a prefix of the event's parameter list, so
/// topics followed by data words give the parameters in declaration order.
fn decode_log(raw: &RawLog) -> LedgerResult<Option<LedgerLog>> {
    let Some(topic0) = raw.topics.first() else {
        return Ok(None);
    };
    let mut params: Vec<abi::Word> = raw.topics[1..]
        .iter()
        .map(|topic| abi::decode_hex(topic).and_then(|bytes| abi::word_at(&bytes, 0)))
        .collect::<LedgerResult<_>>()?;
    params.extend(abi::words(&abi::decode_hex(&raw.data)?));
    let param = |i: usize| {
        params
            .get(i)
            .ok_or_else(|| LedgerError::Decode(format!("event is missing parameter {i}")))
    };
    let event = match topic0.to_lowercase().as_str() {
        abi::SQUARE_PURCHASED_TOPIC => {
            let raw_index = abi::as_u64(param(1)?)?;
            let index = u8::try_from(raw_index)
                .ok()
                .and_then(SquareIndex::new)
                .ok_or_else(|| LedgerError::Decode(format!("square index {raw_index}")))?;
            LedgerEvent::SquarePurchased {
                player: abi::as_address(param(0)?),
                index,
            }
        }
        abi::GAME_STARTED_TOPIC => LedgerEvent::GameStarted,
        abi::GAME_ENDED_TOPIC => {
            let winner = abi::as_address(param(2)?);
            LedgerEvent::GameEnded {
                home_score: abi::as_u32(param(0)?)?,
                away_score: abi::as_u32(param(1)?)?,
                winner: (!winner.is_zero()).then_some(winner),
                prize: Amount::from_wei(abi::as_u128(param(3)?)?),
            }
        }
        _ => return Ok(None),
    };
    let tx = raw
        .transaction_hash
        .as_deref()
        .and_then(|hash| hash.parse().ok());
    Ok(Some(LedgerLog { tx, event }))
}

/// Wallet backed by a node-managed account.
pub struct RpcWallet {
    transport: RpcTransport,
    address: Option<Address>,
    chain_id: Option<u64>,
}

impl RpcWallet {
    /// Reads the node's chain id once; the session is pinned to it afterwards.
    pub async fn connect(
        url: impl Into<String>,
        address: Option<Address>,
        request_timeout: Duration,
    ) -> LedgerResult<Self> {
        let transport = RpcTransport::new(url, request_timeout)?;
        let value = transport.request("eth_chainId", json!([])).await?;
        let chain_id = parse_u64_quantity(&value)?;
        Ok(Self {
            transport,
            address,
            chain_id: Some(chain_id),
        })
    }
}

impl WalletSession for RpcWallet {
    fn current_address(&self) -> Option<Address> {
        self.address
    }

    fn current_chain_id(&self) -> Option<u64> {
        self.chain_id
    }

    async fn balance_of(&self, address: Address) -> LedgerResult<Amount> {
        let value = self
            .transport
            .request("eth_getBalance", json!([address.to_string(), "latest"]))
            .await?;
        Ok(Amount::from_wei(parse_quantity(&value)?))
    }
}
