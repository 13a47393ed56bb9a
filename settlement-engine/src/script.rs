//! Multisig escrow script builder
//!
//! Constructs the 2-of-3 locking script that holds escrowed funds on chain,
//! plans and seals the funding transaction that pays into it, and assembles
//! the spending transaction once enough parties have signed. Everything in
//! this module is a pure function of its inputs and safe to run concurrently
//! across payments.
//!
//! Transaction bytes follow the legacy serialization of the Bitcoin lineage:
//! version, varint-counted inputs and outputs, locktime. The spending digest
//! is the classic SIGHASH_ALL construction: the input's script replaced by
//! the script being spent, the 4-byte hash type appended, double SHA-256
//! over the whole thing.

use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};

use crate::error::SettlementError;
use crate::SettlementResult;

/// Fixed miner-fee allowance deducted from every escrow spend, smallest units
pub const MINER_FEE: u64 = 500;

/// Outputs at or below this value are uneconomical to spend and are folded
/// into a neighbouring output instead of being created
pub const DUST_LIMIT: u64 = 546;

const SIGHASH_ALL: u8 = 0x01;

const OP_0: u8 = 0x00;
const OP_PUSHDATA1: u8 = 0x4c;
const OP_2: u8 = 0x52;
const OP_3: u8 = 0x53;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKMULTISIG: u8 = 0xae;

const COMPRESSED_KEY_LEN: usize = 33;

/// A locking or unlocking script as raw bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script(Vec<u8>);

impl Script {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> SettlementResult<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| SettlementError::script(format!("invalid script hex: {e}")))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    fn push_opcode(&mut self, op: u8) {
        self.0.push(op);
    }

    fn push_data(&mut self, data: &[u8]) {
        if data.len() < OP_PUSHDATA1 as usize {
            self.0.push(data.len() as u8);
        } else {
            // Signatures and keys never exceed one byte of length
            self.0.push(OP_PUSHDATA1);
            self.0.push(data.len() as u8);
        }
        self.0.extend_from_slice(data);
    }
}

impl Default for Script {
    fn default() -> Self {
        Self::new()
    }
}

/// Reference to a specific transaction output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutPoint {
    pub txid: [u8; 32],
    pub vout: u32,
}

impl OutPoint {
    pub fn from_hex(txid_hex: &str, vout: u32) -> SettlementResult<Self> {
        let bytes = hex::decode(txid_hex)
            .map_err(|e| SettlementError::script(format!("invalid txid hex: {e}")))?;
        let txid: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SettlementError::script("txid must be 32 bytes"))?;
        Ok(Self { txid, vout })
    }
}

/// Transaction input
#[derive(Debug, Clone)]
pub struct TxInput {
    pub previous_output: OutPoint,
    pub script_sig: Script,
    pub sequence: u32,
}

impl TxInput {
    fn unsigned(previous_output: OutPoint) -> Self {
        Self {
            previous_output,
            script_sig: Script::new(),
            sequence: 0xffff_ffff,
        }
    }
}

/// Transaction output
#[derive(Debug, Clone)]
pub struct TxOutput {
    /// Value in smallest units
    pub value: u64,
    pub script_pubkey: Script,
}

/// A legacy-format transaction
#[derive(Debug, Clone)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Transaction {
    fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        Self {
            version: 1,
            inputs,
            outputs,
            lock_time: 0,
        }
    }

    /// Serialize to consensus bytes
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(&self.version.to_le_bytes());
        write_varint(&mut buf, self.inputs.len() as u64);
        for input in &self.inputs {
            buf.extend_from_slice(&input.previous_output.txid);
            buf.extend_from_slice(&input.previous_output.vout.to_le_bytes());
            write_varint(&mut buf, input.script_sig.as_bytes().len() as u64);
            buf.extend_from_slice(input.script_sig.as_bytes());
            buf.extend_from_slice(&input.sequence.to_le_bytes());
        }
        write_varint(&mut buf, self.outputs.len() as u64);
        for output in &self.outputs {
            buf.extend_from_slice(&output.value.to_le_bytes());
            write_varint(&mut buf, output.script_pubkey.as_bytes().len() as u64);
            buf.extend_from_slice(output.script_pubkey.as_bytes());
        }
        buf.extend_from_slice(&self.lock_time.to_le_bytes());
        buf
    }

    /// Double SHA-256 of the serialized transaction
    pub fn txid(&self) -> [u8; 32] {
        sha256d(&self.serialize())
    }

    pub fn txid_hex(&self) -> String {
        hex::encode(self.txid())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.serialize())
    }
}

fn write_varint(buf: &mut Vec<u8>, n: u64) {
    if n < 0xfd {
        buf.push(n as u8);
    } else if n <= 0xffff {
        buf.push(0xfd);
        buf.extend_from_slice(&(n as u16).to_le_bytes());
    } else if n <= 0xffff_ffff {
        buf.push(0xfe);
        buf.extend_from_slice(&(n as u32).to_le_bytes());
    } else {
        buf.push(0xff);
        buf.extend_from_slice(&n.to_le_bytes());
    }
}

fn sha256d(bytes: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(bytes);
    let second = Sha256::digest(first);
    second.into()
}

/// Pay-to-public-key locking script: `<key> OP_CHECKSIG`
pub fn p2pk_script(key: &PublicKey) -> Script {
    let mut script = Script::new();
    script.push_data(&key.serialize());
    script.push_opcode(OP_CHECKSIG);
    script
}

/// Deterministic 2-of-3 locking script over exactly these three keys:
/// `OP_2 <buyer> <provider> <admin> OP_3 OP_CHECKMULTISIG`
pub fn build_escrow_script(
    buyer: &PublicKey,
    provider: &PublicKey,
    admin: &PublicKey,
) -> Script {
    let mut script = Script::new();
    script.push_opcode(OP_2);
    for key in [buyer, provider, admin] {
        script.push_data(&key.serialize());
    }
    script.push_opcode(OP_3);
    script.push_opcode(OP_CHECKMULTISIG);
    script
}

/// Recover the three public keys from a 2-of-3 escrow locking script
pub fn parse_escrow_script(script: &Script) -> SettlementResult<[PublicKey; 3]> {
    let bytes = script.as_bytes();
    let expected_len = 3 + 3 * (1 + COMPRESSED_KEY_LEN);
    if bytes.len() != expected_len || bytes[0] != OP_2 {
        return Err(SettlementError::script("not a 2-of-3 escrow script"));
    }
    if bytes[expected_len - 2] != OP_3 || bytes[expected_len - 1] != OP_CHECKMULTISIG {
        return Err(SettlementError::script("not a 2-of-3 escrow script"));
    }

    let mut keys = Vec::with_capacity(3);
    let mut cursor = 1;
    for _ in 0..3 {
        if bytes[cursor] as usize != COMPRESSED_KEY_LEN {
            return Err(SettlementError::script("escrow script key push malformed"));
        }
        cursor += 1;
        let key = PublicKey::from_slice(&bytes[cursor..cursor + COMPRESSED_KEY_LEN])
            .map_err(|e| SettlementError::script(format!("escrow script key invalid: {e}")))?;
        keys.push(key);
        cursor += COMPRESSED_KEY_LEN;
    }

    Ok([keys[0], keys[1], keys[2]])
}

/// SIGHASH_ALL digest for one input of a transaction
pub fn signature_hash(tx: &Transaction, input_index: usize, script_code: &Script) -> [u8; 32] {
    let mut preimage = tx.clone();
    for input in &mut preimage.inputs {
        input.script_sig = Script::new();
    }
    preimage.inputs[input_index].script_sig = script_code.clone();

    let mut bytes = preimage.serialize();
    bytes.extend_from_slice(&u32::from(SIGHASH_ALL).to_le_bytes());
    sha256d(&bytes)
}

/// An unspent output the payer can fund the escrow from (P2PK)
#[derive(Debug, Clone)]
pub struct SpendableInput {
    pub outpoint: OutPoint,
    /// Value in smallest units
    pub amount: u64,
    /// Key whose P2PK script locks this output
    pub owner: PublicKey,
}

/// Funding transaction ready for signing: inputs selected, outputs laid out,
/// one digest per input awaiting the payer's signature
#[derive(Debug, Clone)]
pub struct FundingPlan {
    pub transaction: Transaction,
    pub selected: Vec<SpendableInput>,
    pub input_digests: Vec<[u8; 32]>,
    pub escrow_vout: u32,
}

/// A broadcast-ready funding transaction
#[derive(Debug, Clone)]
pub struct FundedEscrow {
    pub tx_hex: String,
    pub txid: String,
    pub escrow_vout: u32,
}

/// Select inputs covering `amount` plus the miner-fee allowance and lay out
/// the escrow output, with change above the dust threshold returned to the
/// payer's P2PK script.
pub fn plan_funding(
    utxos: &[SpendableInput],
    locking_script: &Script,
    amount: u64,
    change_key: &PublicKey,
) -> SettlementResult<FundingPlan> {
    let needed = amount
        .checked_add(MINER_FEE)
        .ok_or_else(|| SettlementError::script("funding amount overflow"))?;

    let mut selected = Vec::new();
    let mut total = 0u64;
    for utxo in utxos {
        selected.push(utxo.clone());
        total = total.saturating_add(utxo.amount);
        if total >= needed {
            break;
        }
    }
    if total < needed {
        return Err(SettlementError::InsufficientFunds {
            needed,
            available: total,
        });
    }

    let mut outputs = vec![TxOutput {
        value: amount,
        script_pubkey: locking_script.clone(),
    }];
    let change = total - needed;
    if change > DUST_LIMIT {
        outputs.push(TxOutput {
            value: change,
            script_pubkey: p2pk_script(change_key),
        });
    }
    // Sub-dust change is abandoned to the miner fee

    let inputs = selected
        .iter()
        .map(|utxo| TxInput::unsigned(utxo.outpoint))
        .collect();
    let transaction = Transaction::new(inputs, outputs);

    let input_digests = selected
        .iter()
        .enumerate()
        .map(|(i, utxo)| signature_hash(&transaction, i, &p2pk_script(&utxo.owner)))
        .collect();

    Ok(FundingPlan {
        transaction,
        selected,
        input_digests,
        escrow_vout: 0,
    })
}

/// Attach one verified signature per input and produce the broadcast-ready
/// funding transaction. Signatures must be given in input order.
pub fn seal_funding(plan: FundingPlan, signatures: &[Signature]) -> SettlementResult<FundedEscrow> {
    if signatures.len() != plan.selected.len() {
        return Err(SettlementError::script(format!(
            "expected {} funding signatures, got {}",
            plan.selected.len(),
            signatures.len()
        )));
    }

    let secp = Secp256k1::verification_only();
    let mut tx = plan.transaction;
    for (i, (utxo, sig)) in plan.selected.iter().zip(signatures).enumerate() {
        let message = digest_message(&plan.input_digests[i])?;
        secp.verify_ecdsa(&message, sig, &utxo.owner).map_err(|_| {
            SettlementError::invalid_signature(format!("funding input {i} signature rejected"))
        })?;

        let mut script_sig = Script::new();
        script_sig.push_data(&sig_with_hashtype(sig));
        tx.inputs[i].script_sig = script_sig;
    }

    Ok(FundedEscrow {
        tx_hex: tx.to_hex(),
        txid: tx.txid_hex(),
        escrow_vout: plan.escrow_vout,
    })
}

/// One-shot funding when the caller holds the payer key directly.
/// Production paths sign through the wallet boundary via
/// [`plan_funding`] / [`seal_funding`] instead.
pub fn fund_escrow(
    utxos: &[SpendableInput],
    locking_script: &Script,
    amount: u64,
    change_key: &PublicKey,
    payer_key: &SecretKey,
) -> SettlementResult<FundedEscrow> {
    let plan = plan_funding(utxos, locking_script, amount, change_key)?;
    let secp = Secp256k1::new();
    let signatures: Vec<Signature> = plan
        .input_digests
        .iter()
        .map(|digest| Ok(secp.sign_ecdsa(&digest_message(digest)?, payer_key)))
        .collect::<SettlementResult<_>>()?;
    seal_funding(plan, &signatures)
}

/// The exact byte sequence a party must sign to authorize spending the
/// escrow into this candidate output set
pub fn compute_spending_digest(
    escrow_ref: OutPoint,
    locking_script: &Script,
    outputs: &[TxOutput],
) -> [u8; 32] {
    let tx = Transaction::new(vec![TxInput::unsigned(escrow_ref)], outputs.to_vec());
    signature_hash(&tx, 0, locking_script)
}

/// A transaction-level signature attributed to one of the escrow keys
#[derive(Debug, Clone)]
pub struct SpendSignature {
    pub pubkey: PublicKey,
    pub signature: Signature,
}

/// Assemble the unlocking script from at least two valid signatures and
/// return the spending transaction.
///
/// Signatures are verified against the digest and matched to the locking
/// script's keys; the unlocking script lists them in script-key order as
/// OP_CHECKMULTISIG requires. Fails with a script error unless two distinct
/// script keys have a valid signature.
pub fn finalize_spend(
    escrow_ref: OutPoint,
    locking_script: &Script,
    signatures: &[SpendSignature],
    outputs: &[TxOutput],
) -> SettlementResult<Transaction> {
    let script_keys = parse_escrow_script(locking_script)?;
    let digest = compute_spending_digest(escrow_ref, locking_script, outputs);
    let message = digest_message(&digest)?;
    let secp = Secp256k1::verification_only();

    // key index -> signature, deduplicating same-key submissions
    let mut by_key: Vec<Option<&SpendSignature>> = vec![None; 3];
    for sig in signatures {
        let Some(index) = script_keys.iter().position(|k| *k == sig.pubkey) else {
            return Err(SettlementError::script(
                "spend signature from a key outside the escrow script",
            ));
        };
        if secp
            .verify_ecdsa(&message, &sig.signature, &sig.pubkey)
            .is_err()
        {
            return Err(SettlementError::script(format!(
                "spend signature for script key {index} failed verification"
            )));
        }
        by_key[index].get_or_insert(sig);
    }

    let valid: Vec<&SpendSignature> = by_key.iter().flatten().copied().collect();
    if valid.len() < 2 {
        return Err(SettlementError::script(format!(
            "2 valid signatures required, have {}",
            valid.len()
        )));
    }

    // OP_CHECKMULTISIG consumes one extra stack item
    let mut script_sig = Script::new();
    script_sig.push_opcode(OP_0);
    for sig in valid.iter().take(2) {
        script_sig.push_data(&sig_with_hashtype(&sig.signature));
    }

    let mut tx = Transaction::new(vec![TxInput::unsigned(escrow_ref)], outputs.to_vec());
    tx.inputs[0].script_sig = script_sig;
    Ok(tx)
}

/// Release outputs: seller payout of amount − platform fee, with the
/// residual above the dust threshold returned to the escrow script, else
/// folded into the payout.
pub fn release_outputs(
    amount: u64,
    platform_fee: u64,
    seller: &PublicKey,
    escrow_script: &Script,
) -> SettlementResult<Vec<TxOutput>> {
    let spendable = spendable_after_fee(amount)?;
    let payout = amount - platform_fee;
    if payout >= spendable {
        // Fee allowance swallows the platform margin; seller takes the rest
        return Ok(vec![TxOutput {
            value: spendable,
            script_pubkey: p2pk_script(seller),
        }]);
    }

    let residual = spendable - payout;
    if residual > DUST_LIMIT {
        Ok(vec![
            TxOutput {
                value: payout,
                script_pubkey: p2pk_script(seller),
            },
            TxOutput {
                value: residual,
                script_pubkey: escrow_script.clone(),
            },
        ])
    } else {
        Ok(vec![TxOutput {
            value: spendable,
            script_pubkey: p2pk_script(seller),
        }])
    }
}

/// Refund outputs: the escrowed amount minus the miner-fee allowance back
/// to the buyer
pub fn refund_outputs(amount: u64, buyer: &PublicKey) -> SettlementResult<Vec<TxOutput>> {
    let spendable = spendable_after_fee(amount)?;
    Ok(vec![TxOutput {
        value: spendable,
        script_pubkey: p2pk_script(buyer),
    }])
}

/// Split outputs: buyer share by integer percentage, seller remainder after
/// the platform fee, residual handled as in release
pub fn split_outputs(
    amount: u64,
    platform_fee: u64,
    percent: u8,
    buyer: &PublicKey,
    seller: &PublicKey,
    escrow_script: &Script,
) -> SettlementResult<Vec<TxOutput>> {
    let spendable = spendable_after_fee(amount)?;
    let (buyer_share, seller_share) = crate::currency::split_amounts(amount, platform_fee, percent);

    // The miner fee comes out of the platform margin first, then the seller
    let mut buyer_share = buyer_share.min(spendable);
    let mut seller_share = seller_share.min(spendable - buyer_share);

    // Sub-dust shares are folded into the counterparty rather than creating
    // an unspendable output
    if buyer_share > 0 && buyer_share <= DUST_LIMIT {
        seller_share += buyer_share;
        buyer_share = 0;
    }
    if seller_share > 0 && seller_share <= DUST_LIMIT {
        buyer_share += seller_share;
        seller_share = 0;
    }

    let mut outputs = Vec::with_capacity(3);
    if buyer_share > 0 {
        outputs.push(TxOutput {
            value: buyer_share,
            script_pubkey: p2pk_script(buyer),
        });
    }
    if seller_share > 0 {
        outputs.push(TxOutput {
            value: seller_share,
            script_pubkey: p2pk_script(seller),
        });
    }
    if outputs.is_empty() {
        return Err(SettlementError::script(
            "split produces no spendable outputs",
        ));
    }

    let residual = spendable - buyer_share - seller_share;
    if residual > DUST_LIMIT {
        outputs.push(TxOutput {
            value: residual,
            script_pubkey: escrow_script.clone(),
        });
    } else if residual > 0 {
        // Fold into the last party output
        if let Some(last) = outputs.last_mut() {
            last.value += residual;
        }
    }

    Ok(outputs)
}

fn spendable_after_fee(amount: u64) -> SettlementResult<u64> {
    amount
        .checked_sub(MINER_FEE)
        .filter(|v| *v > 0)
        .ok_or_else(|| {
            SettlementError::script(format!(
                "escrowed amount {amount} cannot cover the {MINER_FEE} unit miner fee"
            ))
        })
}

fn sig_with_hashtype(sig: &Signature) -> Vec<u8> {
    let mut bytes = sig.serialize_der().to_vec();
    bytes.push(SIGHASH_ALL);
    bytes
}

fn digest_message(digest: &[u8; 32]) -> SettlementResult<Message> {
    Message::from_digest_slice(digest)
        .map_err(|e| SettlementError::script(format!("digest rejected: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::rand::thread_rng;

    fn keypair() -> (SecretKey, PublicKey) {
        Secp256k1::new().generate_keypair(&mut thread_rng())
    }

    fn sign(digest: &[u8; 32], key: &SecretKey) -> Signature {
        let secp = Secp256k1::new();
        secp.sign_ecdsa(&Message::from_digest_slice(digest).unwrap(), key)
    }

    fn escrow_setup() -> ((SecretKey, PublicKey), (SecretKey, PublicKey), (SecretKey, PublicKey), Script) {
        let buyer = keypair();
        let provider = keypair();
        let admin = keypair();
        let script = build_escrow_script(&buyer.1, &provider.1, &admin.1);
        (buyer, provider, admin, script)
    }

    fn funded_outpoint(payer: &(SecretKey, PublicKey), script: &Script, amount: u64) -> OutPoint {
        let utxo = SpendableInput {
            outpoint: OutPoint {
                txid: [7u8; 32],
                vout: 0,
            },
            amount: amount + MINER_FEE + 10_000,
            owner: payer.1,
        };
        let funded = fund_escrow(&[utxo], script, amount, &payer.1, &payer.0).unwrap();
        OutPoint::from_hex(&funded.txid, funded.escrow_vout).unwrap()
    }

    #[test]
    fn escrow_script_is_deterministic_and_parseable() {
        let (buyer, provider, admin, script) = escrow_setup();
        let again = build_escrow_script(&buyer.1, &provider.1, &admin.1);
        assert_eq!(script, again);

        let keys = parse_escrow_script(&script).unwrap();
        assert_eq!(keys[0], buyer.1);
        assert_eq!(keys[1], provider.1);
        assert_eq!(keys[2], admin.1);

        assert!(parse_escrow_script(&p2pk_script(&buyer.1)).is_err());
    }

    #[test]
    fn funding_selects_inputs_and_returns_change() {
        let payer = keypair();
        let (_, _, _, script) = escrow_setup();
        let utxos = vec![
            SpendableInput {
                outpoint: OutPoint {
                    txid: [1u8; 32],
                    vout: 0,
                },
                amount: 60_000,
                owner: payer.1,
            },
            SpendableInput {
                outpoint: OutPoint {
                    txid: [2u8; 32],
                    vout: 1,
                },
                amount: 80_000,
                owner: payer.1,
            },
        ];

        let plan = plan_funding(&utxos, &script, 100_000, &payer.1).unwrap();
        assert_eq!(plan.selected.len(), 2);
        assert_eq!(plan.escrow_vout, 0);
        assert_eq!(plan.transaction.outputs[0].value, 100_000);
        // 140_000 in - 100_000 escrow - 500 fee
        assert_eq!(plan.transaction.outputs[1].value, 39_500);
    }

    #[test]
    fn funding_fails_when_inputs_cannot_cover() {
        let payer = keypair();
        let (_, _, _, script) = escrow_setup();
        let utxos = vec![SpendableInput {
            outpoint: OutPoint {
                txid: [1u8; 32],
                vout: 0,
            },
            amount: 5_000,
            owner: payer.1,
        }];

        let err = plan_funding(&utxos, &script, 100_000, &payer.1).unwrap_err();
        assert!(matches!(err, SettlementError::InsufficientFunds { .. }));
    }

    #[test]
    fn two_of_three_spend_succeeds_for_every_pair() {
        let (buyer, provider, admin, script) = escrow_setup();
        let amount = 100_000;
        let escrow_ref = funded_outpoint(&buyer, &script, amount);

        let outputs = release_outputs(amount, 2_000, &provider.1, &script).unwrap();
        let digest = compute_spending_digest(escrow_ref, &script, &outputs);

        for pair in [
            [&buyer, &provider],
            [&buyer, &admin],
            [&provider, &admin],
        ] {
            let sigs: Vec<SpendSignature> = pair
                .iter()
                .map(|(sk, pk)| SpendSignature {
                    pubkey: *pk,
                    signature: sign(&digest, sk),
                })
                .collect();
            let tx = finalize_spend(escrow_ref, &script, &sigs, &outputs).unwrap();
            let total: u64 = tx.outputs.iter().map(|o| o.value).sum();
            assert_eq!(total, amount - MINER_FEE);
        }
    }

    #[test]
    fn one_signature_is_rejected() {
        let (buyer, provider, _, script) = escrow_setup();
        let amount = 100_000;
        let escrow_ref = funded_outpoint(&buyer, &script, amount);
        let outputs = release_outputs(amount, 2_000, &provider.1, &script).unwrap();
        let digest = compute_spending_digest(escrow_ref, &script, &outputs);

        let sigs = vec![SpendSignature {
            pubkey: buyer.1,
            signature: sign(&digest, &buyer.0),
        }];
        let err = finalize_spend(escrow_ref, &script, &sigs, &outputs).unwrap_err();
        assert!(matches!(err, SettlementError::Script(_)));
    }

    #[test]
    fn mismatched_signature_is_rejected() {
        let (buyer, provider, _, script) = escrow_setup();
        let amount = 100_000;
        let escrow_ref = funded_outpoint(&buyer, &script, amount);
        let outputs = release_outputs(amount, 2_000, &provider.1, &script).unwrap();
        let digest = compute_spending_digest(escrow_ref, &script, &outputs);

        let wrong_digest = [9u8; 32];
        let sigs = vec![
            SpendSignature {
                pubkey: buyer.1,
                signature: sign(&digest, &buyer.0),
            },
            SpendSignature {
                pubkey: provider.1,
                signature: sign(&wrong_digest, &provider.0),
            },
        ];
        let err = finalize_spend(escrow_ref, &script, &sigs, &outputs).unwrap_err();
        assert!(matches!(err, SettlementError::Script(_)));
    }

    #[test]
    fn duplicate_role_signatures_do_not_count_twice() {
        let (buyer, provider, _, script) = escrow_setup();
        let amount = 100_000;
        let escrow_ref = funded_outpoint(&buyer, &script, amount);
        let outputs = release_outputs(amount, 2_000, &provider.1, &script).unwrap();
        let digest = compute_spending_digest(escrow_ref, &script, &outputs);

        let same = SpendSignature {
            pubkey: buyer.1,
            signature: sign(&digest, &buyer.0),
        };
        let err =
            finalize_spend(escrow_ref, &script, &[same.clone(), same], &outputs).unwrap_err();
        assert!(matches!(err, SettlementError::Script(_)));
    }

    #[test]
    fn release_residual_above_dust_returns_to_escrow() {
        let (_, provider, _, script) = escrow_setup();
        // platform fee 2_000 leaves residual 1_500 > dust after the miner fee
        let outputs = release_outputs(100_000, 2_000, &provider.1, &script).unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].value, 98_000);
        assert_eq!(outputs[1].value, 1_500);
        assert_eq!(outputs[1].script_pubkey, script);
    }

    #[test]
    fn release_residual_at_or_below_dust_folds_into_payout() {
        let (_, provider, _, script) = escrow_setup();
        // platform fee 1_000 leaves residual 500 <= dust: fold
        let outputs = release_outputs(100_000, 1_000, &provider.1, &script).unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].value, 99_500);
    }

    #[test]
    fn refund_returns_amount_minus_fee_allowance() {
        let buyer = keypair();
        let outputs = refund_outputs(100_000, &buyer.1).unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].value, 99_500);
        assert_eq!(outputs[0].script_pubkey, p2pk_script(&buyer.1));

        assert!(refund_outputs(MINER_FEE, &buyer.1).is_err());
    }

    #[test]
    fn split_outputs_preserve_value() {
        let buyer = keypair();
        let seller = keypair();
        let (_, _, _, script) = escrow_setup();

        let outputs =
            split_outputs(100_000, 2_000, 50, &buyer.1, &seller.1, &script).unwrap();
        let total: u64 = outputs.iter().map(|o| o.value).sum();
        assert_eq!(total, 100_000 - MINER_FEE);
        // buyer 50_000, seller 48_000, residual 1_500 back to escrow
        assert_eq!(outputs[0].value, 50_000);
        assert_eq!(outputs[1].value, 48_000);
        assert_eq!(outputs[2].value, 1_500);
    }
}
