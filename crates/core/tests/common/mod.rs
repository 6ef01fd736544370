#![allow(dead_code)]

use std::time::Duration;

pub const SPS: &[u8] = &[0x67, 0x64, 0x00, 0x1F, 0xAC, 0xD9];
pub const PPS: &[u8] = &[0x68, 0xEB, 0xE3, 0xCB];
pub const ASC: &[u8] = &[0x12, 0x10];

/// Poll `f` every 20 ms for up to 5 s.
pub async fn wait_until(mut f: impl FnMut() -> bool) {
    for _ in 0..250 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}
