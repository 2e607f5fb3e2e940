//! 비트 플래그 코덱
//!
//! bool 목록을 8개 단위 윈도우로 잘라 1바이트에 담음 (LSB 먼저)

/// 한 플래그 바이트가 담는 비트 수
pub const FLAG_BITS: usize = 8;

/// `acked[start..end]` 를 한 바이트로 인코딩
///
/// 비트 `i - start` 가 `acked[i]` 에 대응. 입력 길이를 넘는 비트와
/// 8번째 이후 비트는 0.
pub fn encode(acked: &[bool], start: usize, end: usize) -> u8 {
    let end = end.min(start + FLAG_BITS);
    let mut flag = 0u8;
    for i in start..end {
        if acked.get(i).copied().unwrap_or(false) {
            flag |= 1 << (i - start);
        }
    }
    flag
}

/// 플래그 바이트를 `into[start..end]` 에 디코딩
///
/// 켜진 비트만 true로 기록하고 꺼진 비트는 건드리지 않음.
/// 범위를 벗어나는 인덱스는 무시.
pub fn decode(flag: u8, start: usize, end: usize, into: &mut [bool]) {
    let width = end.saturating_sub(start).min(FLAG_BITS);
    for bit in 0..width {
        if flag & (1 << bit) == 0 {
            continue;
        }
        if let Some(slot) = into.get_mut(start + bit) {
            *slot = true;
        }
    }
}

/// `count` 개 비트를 담는 데 필요한 바이트 수
pub fn flag_bytes(count: usize) -> usize {
    (count + FLAG_BITS - 1) / FLAG_BITS
}
