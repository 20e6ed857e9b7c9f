#![no_main]

use libfuzzer_sys::fuzz_target;
use nativescope::{codeman::EhEnumerator, Parser};

fuzz_target!(|data: &[u8]| {
    let Ok(clauses) = EhEnumerator::new(Parser::new(data), 0x1_4000_0000, 0x1_4000_1000) else {
        return;
    };
    for clause in clauses {
        if clause.is_err() {
            break;
        }
    }
});
