// Number <-> string primitives (the lobject.c corner of the core).

/// Format a number the way `tostring` does: `%.14g` semantics. Integers
/// within the exact range print without a fractional part, via the `itoa`
/// fast path.
pub fn num_to_buf(n: f64) -> String {
    if n == 0.0 && n.is_sign_negative() {
        // the integer cast would drop the sign of negative zero
        return "-0".to_string();
    }
    if n == n.floor() && n.abs() < 1e15 && n.is_finite() {
        let mut buf = itoa::Buffer::new();
        return buf.format(n as i64).to_string();
    }
    if n.is_nan() {
        return "nan".to_string();
    }
    if n.is_infinite() {
        return if n < 0.0 { "-inf" } else { "inf" }.to_string();
    }
    let mut s = format!("{:.14e}", n);
    // %.14g: prefer plain notation when the exponent is small
    if let Some(epos) = s.find('e') {
        let exp: i32 = s[epos + 1..].parse().unwrap_or(0);
        if (-5..15).contains(&exp) {
            s = format!("{:.*}", (14 - exp).max(0) as usize, n);
            while s.contains('.') && (s.ends_with('0') || s.ends_with('.')) {
                s.pop();
            }
        } else {
            let mantissa = s[..epos].trim_end_matches('0').trim_end_matches('.');
            s = format!("{}e{}{:02}", mantissa, if exp < 0 { "-" } else { "+" }, exp.abs());
        }
    }
    s
}

/// Parse a numeral: optional surrounding spaces, decimal or `0x` hex,
/// rejecting trailing garbage. Mirrors `luaO_str2d`.
pub fn str_to_num(bytes: &[u8]) -> Option<f64> {
    let s = std::str::from_utf8(bytes).ok()?;
    let t = s.trim_matches(|c: char| c.is_ascii_whitespace());
    if t.is_empty() {
        return None;
    }
    let (neg, body) = match t.as_bytes()[0] {
        b'-' => (true, &t[1..]),
        b'+' => (false, &t[1..]),
        _ => (false, t),
    };
    // "nan"/"inf"/"infinity" are not numerals
    if body.bytes().any(|b| b == b'n' || b == b'N') {
        return None;
    }
    let n = if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        if hex.is_empty() {
            return None;
        }
        u64::from_str_radix(hex, 16).ok()? as f64
    } else {
        body.parse::<f64>().ok()?
    };
    Some(if neg { -n } else { n })
}

/// "Floating byte" encoding used by NEWTABLE size hints:
/// `eeeeexxx` means `1xxx << (eeeee - 1)` when `eeeee > 0`, else `xxx`.
pub fn int2fb(mut x: u32) -> u32 {
    let mut e = 0u32;
    while x >= 16 {
        x = (x + 1) >> 1;
        e += 1;
    }
    if x < 8 { x } else { ((e + 1) << 3) | (x - 8) }
}

pub fn fb2int(x: u32) -> u32 {
    let e = (x >> 3) & 0x1F;
    if e == 0 { x } else { ((x & 7) + 8) << (e - 1) }
}
