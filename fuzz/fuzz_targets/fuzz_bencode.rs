#![no_main]
use gosh_core::bencode;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // decode must never panic on arbitrary input, and a successful
    // decode must be safe to walk
    if let Ok(tree) = bencode::decode(data, 100) {
        let _ = tree.int_value();
        let _ = tree.dict_find(b"info");
        let _ = tree.list_at(0);
        let _ = format!("{:?}", tree);
    }
    let _ = bencode::decode_strict(data, 100);
});
