//! Wire Decoder
//!
//! Normalizes upstream frames into `RawTx`. The upstream message graph
//! varies in shape (account keys as raw bytes on gRPC, base58 strings on
//! the JSON replay path; inner instructions sometimes absent), so every
//! shape is modeled as a `FramePayload` variant and this module is the
//! only place allowed to branch on it. Undecodable frames are dropped
//! with the `ingest_decode_error` counter; decoding never raises across
//! the task boundary.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::debug;
use yellowstone_grpc_proto::geyser::{
    SubscribeUpdateAccount, SubscribeUpdateBlockMeta, SubscribeUpdateTransaction,
};

use crate::blocktime::{normalize_block_time, SlotClock};
use crate::metrics;

/// One account key, kept both ways: raw bytes for comparisons on the hot
/// path, base58 for everything that leaves the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountKey {
    pub bytes: [u8; 32],
    pub base58: String,
}

impl AccountKey {
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        let bytes: [u8; 32] = raw.try_into().ok()?;
        Some(Self {
            base58: bs58::encode(&bytes).into_string(),
            bytes,
        })
    }

    pub fn from_base58(s: &str) -> Option<Self> {
        let decoded = bs58::decode(s).into_vec().ok()?;
        let bytes: [u8; 32] = decoded.try_into().ok()?;
        Some(Self {
            bytes,
            base58: s.to_string(),
        })
    }
}

/// A compiled instruction with indexes into the account key table
#[derive(Debug, Clone)]
pub struct RawInstruction {
    pub program_id_index: usize,
    pub accounts: Vec<u8>,
    pub data: Bytes,
}

/// A token balance snapshot from transaction meta
#[derive(Debug, Clone)]
pub struct RawTokenBalance {
    pub account_index: usize,
    pub mint: String,
    pub owner: Option<String>,
    pub amount: u64,
    pub decimals: u8,
}

/// Neutral transaction record every downstream component consumes
#[derive(Debug, Clone)]
pub struct RawTx {
    pub signature: String,
    pub slot: u64,
    pub block_time: DateTime<Utc>,
    /// Static keys followed by loaded lookup-table addresses, in the
    /// order instruction indexes expect
    pub account_keys: Vec<AccountKey>,
    pub num_signers: usize,
    pub instructions: Vec<RawInstruction>,
    /// Inner instruction groups keyed by top-level instruction index
    pub inner_instructions: Vec<(usize, Vec<RawInstruction>)>,
    pub logs: Vec<String>,
    pub pre_balances: Vec<u64>,
    pub post_balances: Vec<u64>,
    pub pre_token_balances: Vec<RawTokenBalance>,
    pub post_token_balances: Vec<RawTokenBalance>,
    pub failed: bool,
}

impl RawTx {
    /// Fee payer is by convention the first account key
    pub fn fee_payer(&self) -> Option<&AccountKey> {
        self.account_keys.first()
    }

    pub fn key_at(&self, index: usize) -> Option<&AccountKey> {
        self.account_keys.get(index)
    }
}

/// Account update normalized from the stream
#[derive(Debug, Clone)]
pub struct RawAccountUpdate {
    pub pubkey: AccountKey,
    pub owner: AccountKey,
    pub lamports: u64,
    pub data: Bytes,
    pub slot: u64,
}

/// Every concrete upstream payload shape. New shapes get a new variant
/// here; nothing else in the crate is allowed to sniff payloads.
#[derive(Debug)]
pub enum FramePayload {
    GrpcTransaction(SubscribeUpdateTransaction),
    GrpcAccount(SubscribeUpdateAccount),
    GrpcBlockMeta(SubscribeUpdateBlockMeta),
    /// Replay path: transactions fetched as JSON
    JsonTransaction(serde_json::Value),
}

/// Decoded frame handed to the parser stage
#[derive(Debug)]
pub enum DecodedFrame {
    Transaction(RawTx),
    Account(RawAccountUpdate),
    BlockMeta { slot: u64, block_time_secs: i64 },
}

pub struct WireDecoder {
    slot_clock: SlotClock,
}

impl WireDecoder {
    pub fn new(slot_clock: SlotClock) -> Self {
        Self { slot_clock }
    }

    /// Decode one frame. `None` means the frame was dropped; genuinely
    /// undecodable shapes increment the decode error counter, expected
    /// drops (votes, block metas without a time) do not.
    pub fn decode(&self, payload: FramePayload) -> Option<DecodedFrame> {
        let decoded = match payload {
            FramePayload::GrpcTransaction(update) => {
                if update
                    .transaction
                    .as_ref()
                    .map(|t| t.is_vote)
                    .unwrap_or(false)
                {
                    return None;
                }
                self.decode_grpc_transaction(update).map(DecodedFrame::Transaction)
            }
            FramePayload::GrpcAccount(update) => {
                self.decode_grpc_account(update).map(DecodedFrame::Account)
            }
            FramePayload::GrpcBlockMeta(meta) => {
                let Some(block_time) = meta.block_time else {
                    return None;
                };
                self.slot_clock.observe(meta.slot, block_time.timestamp);
                Some(DecodedFrame::BlockMeta {
                    slot: meta.slot,
                    block_time_secs: block_time.timestamp,
                })
            }
            FramePayload::JsonTransaction(value) => {
                self.decode_json_transaction(&value).map(DecodedFrame::Transaction)
            }
        };

        if decoded.is_none() {
            metrics::INGEST_DECODE_ERRORS.inc();
            debug!("🗑️ Dropped undecodable frame");
        }
        decoded
    }

    fn decode_grpc_transaction(&self, update: SubscribeUpdateTransaction) -> Option<RawTx> {
        let slot = update.slot;
        let info = update.transaction?;
        let tx = info.transaction?;
        let meta = info.meta?;
        let message = tx.message?;

        let signature = bs58::encode(&info.signature).into_string();

        let mut account_keys: Vec<AccountKey> = Vec::with_capacity(
            message.account_keys.len()
                + meta.loaded_writable_addresses.len()
                + meta.loaded_readonly_addresses.len(),
        );
        for raw in &message.account_keys {
            account_keys.push(AccountKey::from_bytes(raw)?);
        }
        // Versioned transactions resolve lookup-table addresses after the
        // static keys: writable first, then readonly
        for raw in &meta.loaded_writable_addresses {
            account_keys.push(AccountKey::from_bytes(raw)?);
        }
        for raw in &meta.loaded_readonly_addresses {
            account_keys.push(AccountKey::from_bytes(raw)?);
        }

        let num_signers = message
            .header
            .as_ref()
            .map(|h| h.num_required_signatures as usize)
            .unwrap_or(1);

        let instructions = message
            .instructions
            .iter()
            .map(|ix| RawInstruction {
                program_id_index: ix.program_id_index as usize,
                accounts: ix.accounts.clone(),
                data: Bytes::from(ix.data.clone()),
            })
            .collect();

        let inner_instructions = meta
            .inner_instructions
            .iter()
            .map(|group| {
                let instructions = group
                    .instructions
                    .iter()
                    .map(|ix| RawInstruction {
                        program_id_index: ix.program_id_index as usize,
                        accounts: ix.accounts.clone(),
                        data: Bytes::from(ix.data.clone()),
                    })
                    .collect();
                (group.index as usize, instructions)
            })
            .collect();

        let pre_token_balances = meta
            .pre_token_balances
            .iter()
            .filter_map(token_balance_from_grpc)
            .collect();
        let post_token_balances = meta
            .post_token_balances
            .iter()
            .filter_map(token_balance_from_grpc)
            .collect();

        Some(RawTx {
            signature,
            slot,
            block_time: self.slot_clock.time_for_slot(slot),
            account_keys,
            num_signers,
            instructions,
            inner_instructions,
            logs: meta.log_messages.clone(),
            pre_balances: meta.pre_balances.clone(),
            post_balances: meta.post_balances.clone(),
            pre_token_balances,
            post_token_balances,
            failed: meta.err.is_some(),
        })
    }

    fn decode_grpc_account(&self, update: SubscribeUpdateAccount) -> Option<RawAccountUpdate> {
        let slot = update.slot;
        let account = update.account?;
        Some(RawAccountUpdate {
            pubkey: AccountKey::from_bytes(&account.pubkey)?,
            owner: AccountKey::from_bytes(&account.owner)?,
            lamports: account.lamports,
            data: Bytes::from(account.data),
            slot,
        })
    }

    /// Replay transactions arrive as JSON with base58 string keys and
    /// base58 instruction data
    fn decode_json_transaction(&self, value: &serde_json::Value) -> Option<RawTx> {
        let slot = value.get("slot")?.as_u64()?;
        let signature = value.get("signature")?.as_str()?.to_string();

        let message = value.get("transaction")?.get("message")?;
        let meta = value.get("meta")?;

        let mut account_keys = Vec::new();
        for key in message.get("accountKeys")?.as_array()? {
            account_keys.push(AccountKey::from_base58(key.as_str()?)?);
        }
        for section in ["writable", "readonly"] {
            if let Some(loaded) = meta
                .get("loadedAddresses")
                .and_then(|l| l.get(section))
                .and_then(|a| a.as_array())
            {
                for key in loaded {
                    account_keys.push(AccountKey::from_base58(key.as_str()?)?);
                }
            }
        }

        let num_signers = message
            .get("header")
            .and_then(|h| h.get("numRequiredSignatures"))
            .and_then(|n| n.as_u64())
            .unwrap_or(1) as usize;

        let mut instructions = Vec::new();
        for ix in message.get("instructions")?.as_array()? {
            instructions.push(json_instruction(ix)?);
        }

        let mut inner_instructions = Vec::new();
        if let Some(groups) = meta.get("innerInstructions").and_then(|v| v.as_array()) {
            for group in groups {
                let index = group.get("index")?.as_u64()? as usize;
                let mut inner = Vec::new();
                for ix in group.get("instructions")?.as_array()? {
                    inner.push(json_instruction(ix)?);
                }
                inner_instructions.push((index, inner));
            }
        }

        let logs = meta
            .get("logMessages")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|l| l.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let block_time = value
            .get("blockTime")
            .and_then(|t| t.as_i64())
            .map(normalize_block_time)
            .unwrap_or_else(|| self.slot_clock.time_for_slot(slot));

        Some(RawTx {
            signature,
            slot,
            block_time,
            account_keys,
            num_signers,
            instructions,
            inner_instructions,
            logs,
            pre_balances: json_u64_list(meta.get("preBalances")),
            post_balances: json_u64_list(meta.get("postBalances")),
            pre_token_balances: json_token_balances(meta.get("preTokenBalances")),
            post_token_balances: json_token_balances(meta.get("postTokenBalances")),
            failed: meta.get("err").map(|e| !e.is_null()).unwrap_or(false),
        })
    }
}

fn token_balance_from_grpc(
    balance: &yellowstone_grpc_proto::prelude::TokenBalance,
) -> Option<RawTokenBalance> {
    let ui = balance.ui_token_amount.as_ref()?;
    Some(RawTokenBalance {
        account_index: balance.account_index as usize,
        mint: balance.mint.clone(),
        owner: if balance.owner.is_empty() {
            None
        } else {
            Some(balance.owner.clone())
        },
        amount: ui.amount.parse().ok()?,
        decimals: ui.decimals as u8,
    })
}

fn json_instruction(ix: &serde_json::Value) -> Option<RawInstruction> {
    let program_id_index = ix.get("programIdIndex")?.as_u64()? as usize;
    let accounts = ix
        .get("accounts")?
        .as_array()?
        .iter()
        .filter_map(|a| a.as_u64().map(|v| v as u8))
        .collect();
    let data = bs58::decode(ix.get("data")?.as_str()?).into_vec().ok()?;
    Some(RawInstruction {
        program_id_index,
        accounts,
        data: Bytes::from(data),
    })
}

fn json_u64_list(value: Option<&serde_json::Value>) -> Vec<u64> {
    value
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_u64()).collect())
        .unwrap_or_default()
}

fn json_token_balances(value: Option<&serde_json::Value>) -> Vec<RawTokenBalance> {
    let Some(arr) = value.and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    arr.iter()
        .filter_map(|b| {
            let amount = b.get("uiTokenAmount")?;
            Some(RawTokenBalance {
                account_index: b.get("accountIndex")?.as_u64()? as usize,
                mint: b.get("mint")?.as_str()?.to_string(),
                owner: b.get("owner").and_then(|o| o.as_str()).map(String::from),
                amount: amount.get("amount")?.as_str()?.parse().ok()?,
                decimals: amount.get("decimals")?.as_u64()? as u8,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decoder() -> WireDecoder {
        WireDecoder::new(SlotClock::new())
    }

    #[test]
    fn test_account_key_roundtrip() {
        let bytes = [7u8; 32];
        let key = AccountKey::from_bytes(&bytes).unwrap();
        let back = AccountKey::from_base58(&key.base58).unwrap();
        assert_eq!(key.bytes, back.bytes);
    }

    #[test]
    fn test_account_key_rejects_bad_lengths() {
        assert!(AccountKey::from_bytes(&[1u8; 31]).is_none());
        assert!(AccountKey::from_base58("not-base58-!!").is_none());
    }

    #[test]
    fn test_json_transaction_decode() {
        let key_a = bs58::encode([1u8; 32]).into_string();
        let key_b = bs58::encode([2u8; 32]).into_string();
        let value = json!({
            "signature": "replaysig1",
            "slot": 5000,
            "blockTime": 1_700_000_000,
            "transaction": {
                "message": {
                    "accountKeys": [key_a, key_b],
                    "header": {"numRequiredSignatures": 1},
                    "instructions": [
                        {"programIdIndex": 1, "accounts": [0], "data": bs58::encode([9u8, 9, 9]).into_string()}
                    ]
                }
            },
            "meta": {
                "err": null,
                "preBalances": [1_000_000_000u64, 0],
                "postBalances": [900_000_000u64, 0],
                "logMessages": ["Program log: hello"],
                "preTokenBalances": [],
                "postTokenBalances": []
            }
        });

        let frame = decoder()
            .decode(FramePayload::JsonTransaction(value))
            .expect("decodes");
        let DecodedFrame::Transaction(tx) = frame else {
            panic!("expected transaction frame");
        };
        assert_eq!(tx.signature, "replaysig1");
        assert_eq!(tx.slot, 5000);
        assert_eq!(tx.account_keys.len(), 2);
        assert_eq!(tx.instructions.len(), 1);
        assert_eq!(tx.instructions[0].data.as_ref(), &[9u8, 9, 9]);
        assert_eq!(tx.block_time.timestamp(), 1_700_000_000);
        assert!(!tx.failed);
    }

    #[test]
    fn test_malformed_json_is_dropped_not_raised() {
        let before = metrics::INGEST_DECODE_ERRORS.get();
        let result = decoder().decode(FramePayload::JsonTransaction(json!({"garbage": true})));
        assert!(result.is_none());
        assert_eq!(metrics::INGEST_DECODE_ERRORS.get(), before + 1);
    }

    #[test]
    fn test_block_meta_feeds_slot_clock() {
        let clock = SlotClock::new();
        let decoder = WireDecoder::new(clock.clone());
        let meta = SubscribeUpdateBlockMeta {
            slot: 42,
            block_time: Some(yellowstone_grpc_proto::prelude::UnixTimestamp {
                timestamp: 1_700_000_000,
            }),
            ..Default::default()
        };
        decoder.decode(FramePayload::GrpcBlockMeta(meta));
        assert_eq!(clock.time_for_slot(42).timestamp(), 1_700_000_000);
    }
}
