use crate::gateway::{ConfirmedTransfer, SettlementGateway, TransferStatus};
use crate::ChainError;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use tranche_types::{ContractAddress, TokenUnits, TxHash, WalletAddress};

const SELECTOR_DECIMALS: &str = "313ce567";
const SELECTOR_BALANCE_OF: &str = "70a08231";
const SELECTOR_TRANSFER: &str = "a9059cbb";
/// keccak256("Transfer(address,address,uint256)")
const TRANSFER_TOPIC: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// ERC-20 gateway over a JSON-RPC provider that holds the custody
/// signer. Key management lives in the provider; this client only
/// shapes calls and parses results.
pub struct JsonRpcGateway {
    client: reqwest::Client,
    url: String,
    custody: WalletAddress,
    /// How far back the reconciliation log scan reaches.
    lookback_blocks: u64,
}

#[derive(Deserialize)]
struct RpcEnvelope<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct Receipt {
    status: String,
    #[serde(rename = "blockNumber")]
    block_number: String,
}

#[derive(Deserialize)]
struct LogEntry {
    #[serde(rename = "transactionHash")]
    transaction_hash: String,
    #[serde(rename = "blockNumber")]
    block_number: String,
    topics: Vec<String>,
    data: String,
}

#[derive(Deserialize)]
struct BlockHeader {
    timestamp: String,
}

fn pad_address(address: &WalletAddress) -> String {
    format!("{:0>64}", hex::encode(address.as_bytes()))
}

fn pad_units(units: TokenUnits) -> String {
    format!("{:064x}", units.raw())
}

fn parse_quantity(s: &str) -> Result<u128, ChainError> {
    let stripped = s.strip_prefix("0x").unwrap_or(s);
    if stripped.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(stripped, 16)
        .map_err(|_| ChainError::Protocol(format!("bad quantity '{}'", s)))
}

impl JsonRpcGateway {
    pub fn new(url: impl Into<String>, custody: WalletAddress, lookback_blocks: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client construction is infallible with static options");
        Self {
            client,
            url: url.into(),
            custody,
            lookback_blocks,
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, ChainError> {
        self.call_opt(method, params)
            .await?
            .ok_or_else(|| ChainError::Protocol(format!("{}: missing result", method)))
    }

    /// Like `call`, but a `null` result is a valid answer (e.g. a receipt
    /// that does not exist yet).
    async fn call_opt<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>, ChainError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChainError::Unavailable(format!("{}: {}", method, e)))?;

        if response.status().as_u16() == 429 {
            return Err(ChainError::RateLimited(format!(
                "{}: provider returned 429",
                method
            )));
        }
        let envelope: RpcEnvelope<T> = response
            .json()
            .await
            .map_err(|e| ChainError::Protocol(format!("{}: {}", method, e)))?;

        if let Some(error) = envelope.error {
            // -32005 is the conventional "limit exceeded" code.
            if error.code == -32005 || error.message.to_lowercase().contains("rate limit") {
                return Err(ChainError::RateLimited(format!(
                    "{}: {}",
                    method, error.message
                )));
            }
            return Err(ChainError::Unavailable(format!(
                "{}: rpc error {}: {}",
                method, error.code, error.message
            )));
        }
        Ok(envelope.result)
    }

    async fn eth_call(&self, to: &ContractAddress, data: String) -> Result<String, ChainError> {
        self.call(
            "eth_call",
            json!([{"to": to.to_string(), "data": data}, "latest"]),
        )
        .await
    }

    async fn block_timestamp(&self, block: u64) -> Result<DateTime<Utc>, ChainError> {
        let header: BlockHeader = self
            .call(
                "eth_getBlockByNumber",
                json!([format!("0x{:x}", block), false]),
            )
            .await?;
        let seconds = parse_quantity(&header.timestamp)? as i64;
        Utc.timestamp_opt(seconds, 0)
            .single()
            .ok_or_else(|| ChainError::Protocol(format!("bad block timestamp for {}", block)))
    }
}

#[async_trait]
impl SettlementGateway for JsonRpcGateway {
    async fn token_decimals(&self, token: &ContractAddress) -> Result<u8, ChainError> {
        let data = format!("0x{}", SELECTOR_DECIMALS);
        let raw = self.eth_call(token, data).await?;
        let value = parse_quantity(&raw)?;
        u8::try_from(value).map_err(|_| ChainError::Protocol(format!("decimals {} out of range", value)))
    }

    async fn token_balance(
        &self,
        token: &ContractAddress,
        holder: &WalletAddress,
    ) -> Result<TokenUnits, ChainError> {
        let data = format!("0x{}{}", SELECTOR_BALANCE_OF, pad_address(holder));
        let raw = self.eth_call(token, data).await?;
        Ok(TokenUnits::from_raw(parse_quantity(&raw)?))
    }

    async fn signer_nonce(&self) -> Result<u64, ChainError> {
        let raw: String = self
            .call(
                "eth_getTransactionCount",
                json!([self.custody.to_string(), "pending"]),
            )
            .await?;
        let value = parse_quantity(&raw)?;
        u64::try_from(value).map_err(|_| ChainError::Protocol(format!("nonce {} out of range", value)))
    }

    async fn submit_transfer(
        &self,
        token: &ContractAddress,
        to: &WalletAddress,
        units: TokenUnits,
        nonce: u64,
    ) -> Result<TxHash, ChainError> {
        let data = format!(
            "0x{}{}{}",
            SELECTOR_TRANSFER,
            pad_address(to),
            pad_units(units)
        );
        let raw: String = self
            .call(
                "eth_sendTransaction",
                json!([{
                    "from": self.custody.to_string(),
                    "to": token.to_string(),
                    "data": data,
                    "nonce": format!("0x{:x}", nonce),
                }]),
            )
            .await?;
        debug!(tx_hash = %raw, nonce = nonce, "Transfer submitted to provider");
        raw.parse()
            .map_err(|_| ChainError::Protocol(format!("bad tx hash '{}'", raw)))
    }

    async fn transfer_status(&self, tx_hash: &TxHash) -> Result<TransferStatus, ChainError> {
        let receipt: Option<Receipt> = self
            .call_opt("eth_getTransactionReceipt", json!([tx_hash.to_string()]))
            .await?;
        match receipt {
            None => Ok(TransferStatus::Pending),
            Some(r) if r.status == "0x1" => {
                let block = parse_quantity(&r.block_number)? as u64;
                Ok(TransferStatus::Confirmed { block })
            }
            Some(_) => Ok(TransferStatus::Reverted),
        }
    }

    async fn head_block(&self) -> Result<u64, ChainError> {
        let raw: String = self.call("eth_blockNumber", json!([])).await?;
        Ok(parse_quantity(&raw)? as u64)
    }

    async fn transfers_to(
        &self,
        token: &ContractAddress,
        to: &WalletAddress,
        since: DateTime<Utc>,
    ) -> Result<Vec<ConfirmedTransfer>, ChainError> {
        let head = self.head_block().await?;
        let from_block = head.saturating_sub(self.lookback_blocks);
        let logs: Vec<LogEntry> = self
            .call(
                "eth_getLogs",
                json!([{
                    "address": token.to_string(),
                    "fromBlock": format!("0x{:x}", from_block),
                    "toBlock": "latest",
                    "topics": [
                        TRANSFER_TOPIC,
                        serde_json::Value::Null,
                        format!("0x{}", pad_address(to)),
                    ],
                }]),
            )
            .await?;

        let mut block_times: HashMap<u64, DateTime<Utc>> = HashMap::new();
        let mut transfers = Vec::new();
        for log in logs {
            let block = parse_quantity(&log.block_number)? as u64;
            let timestamp = match block_times.get(&block) {
                Some(ts) => *ts,
                None => {
                    let ts = self.block_timestamp(block).await?;
                    block_times.insert(block, ts);
                    ts
                }
            };
            if timestamp < since {
                continue;
            }
            if log.topics.len() < 3 {
                continue;
            }
            let units = TokenUnits::from_raw(parse_quantity(&log.data)?);
            let tx_hash = log
                .transaction_hash
                .parse()
                .map_err(|_| ChainError::Protocol(format!("bad tx hash '{}'", log.transaction_hash)))?;
            transfers.push(ConfirmedTransfer {
                tx_hash,
                to: *to,
                units,
                block,
                timestamp,
            });
        }
        Ok(transfers)
    }
}
