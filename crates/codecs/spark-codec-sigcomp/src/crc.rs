//! RFC 1662 FCS16 校验，供 UDVM 的 CRC 指令使用。
//!
//! 多项式 `0x8408`（反射形式），累加器初值 `0xFFFF`；UDVM 直接比较累加结果，不做最终取反。

/// FCS16 累加器初值。
pub const FCS16_INIT: u16 = 0xFFFF;

const FCS16_TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut v = i as u16;
        let mut bit = 0;
        while bit < 8 {
            v = if v & 1 != 0 { (v >> 1) ^ 0x8408 } else { v >> 1 };
            bit += 1;
        }
        table[i] = v;
        i += 1;
    }
    table
}

/// 把 `data` 累加进 `fcs`。
pub fn fcs16(mut fcs: u16, data: &[u8]) -> u16 {
    for byte in data {
        fcs = (fcs >> 8) ^ FCS16_TABLE[((fcs ^ u16::from(*byte)) & 0xff) as usize];
    }
    fcs
}
