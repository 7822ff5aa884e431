//! Standard script templates.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptType {
    P2Pk,
    NullData,
    Unknown,
}

pub const OP_RETURN: u8 = 0x6a;
pub const OP_CHECKSIG: u8 = 0xac;

pub fn classify_script_pubkey(script: &[u8]) -> ScriptType {
    if p2pk_pubkey(script).is_some() {
        ScriptType::P2Pk
    } else if script.first() == Some(&OP_RETURN) {
        ScriptType::NullData
    } else {
        ScriptType::Unknown
    }
}

/// `<pubkey> OP_CHECKSIG` for a 33-byte compressed or 65-byte uncompressed key.
pub fn p2pk_script(pubkey: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(pubkey.len() + 2);
    script.push(pubkey.len() as u8);
    script.extend_from_slice(pubkey);
    script.push(OP_CHECKSIG);
    script
}

pub fn p2pk_pubkey(script: &[u8]) -> Option<&[u8]> {
    let key_len = match script.first().copied() {
        Some(len @ (33 | 65)) => len as usize,
        _ => return None,
    };
    if script.len() != key_len + 2 || script[key_len + 1] != OP_CHECKSIG {
        return None;
    }
    Some(&script[1..=key_len])
}

/// Unspendable script carrying `data`.
pub fn null_data_script(data: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(data.len() + 2);
    script.push(OP_RETURN);
    if !data.is_empty() {
        script.push(data.len().min(75) as u8);
        script.extend_from_slice(&data[..data.len().min(75)]);
    }
    script
}
