use stakd_script::standard::{
    classify_script_pubkey, null_data_script, p2pk_pubkey, p2pk_script, ScriptType,
};

#[test]
fn classify_compressed_p2pk() {
    let key = [0x02; 33];
    let script = p2pk_script(&key);
    assert_eq!(script.len(), 35);
    assert_eq!(classify_script_pubkey(&script), ScriptType::P2Pk);
    assert_eq!(p2pk_pubkey(&script), Some(&key[..]));
}

#[test]
fn classify_uncompressed_p2pk() {
    let key = [0x04; 65];
    let script = p2pk_script(&key);
    assert_eq!(classify_script_pubkey(&script), ScriptType::P2Pk);
}

#[test]
fn wrong_length_prefix_is_unknown() {
    let mut script = vec![32];
    script.extend_from_slice(&[0x02; 32]);
    script.push(0xac);
    assert_eq!(classify_script_pubkey(&script), ScriptType::Unknown);
    assert_eq!(p2pk_pubkey(&script), None);

    let mut missing_checksig = p2pk_script(&[0x03; 33]);
    missing_checksig.pop();
    missing_checksig.push(0x87);
    assert_eq!(classify_script_pubkey(&missing_checksig), ScriptType::Unknown);
}

#[test]
fn null_data() {
    assert_eq!(
        classify_script_pubkey(&null_data_script(b"genesis")),
        ScriptType::NullData
    );
    assert_eq!(classify_script_pubkey(&[]), ScriptType::Unknown);
}
