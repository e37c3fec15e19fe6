#![no_main]

use crypt_target::CryptTable;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(line) = std::str::from_utf8(data) else {
        return;
    };

    // Whatever parses must print back to something that parses the same.
    if let Ok(table) = CryptTable::parse_line(line) {
        let printed = table.to_string();
        let reparsed = CryptTable::parse_line(&printed).expect("printed table parses");
        assert_eq!(reparsed, table);
    }
});
