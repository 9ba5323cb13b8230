//! URL query string splitting and percent-decoding.

use memchr::memchr;

/// Splits a raw query string into `(name, value)` pairs.
///
/// The leading `?` is tolerated, empty pairs are skipped, names and values
/// are returned undecoded. Order is preserved and duplicate names are kept.
///
/// # Examples
/// ```
/// use aras::query::pairs;
///
/// let parsed = pairs(b"name=john&age=25&debug");
/// assert_eq!(parsed.len(), 3);
/// assert_eq!(parsed[0], (&b"name"[..], &b"john"[..]));
/// assert_eq!(parsed[2], (&b"debug"[..], &b""[..]));
/// ```
pub fn pairs(query: &[u8]) -> Vec<(&[u8], &[u8])> {
    let query = query.strip_prefix(b"?").unwrap_or(query);

    query
        .split(|&b| b == b'&')
        .filter(|part| !part.is_empty())
        .map(|part| match memchr(b'=', part) {
            Some(eq) => (&part[..eq], &part[eq + 1..]),
            None => (part, &b""[..]),
        })
        .collect()
}

/// Returns the first value for `name`, percent-decoded with `+` treated
/// as space (the form-encoding convention query strings follow).
pub fn value<'a>(query: &'a [u8], name: &[u8]) -> Option<Vec<u8>> {
    pairs(query)
        .into_iter()
        .find(|&(k, _)| k == name)
        .map(|(_, v)| percent_decode(v, true))
}

/// Percent-decodes `src`. Malformed escapes are passed through literally
/// rather than rejected, which is what every deployed client expects.
///
/// `plus_as_space` additionally maps `+` to a space; enable it for query
/// components only, never for paths.
pub fn percent_decode(src: &[u8], plus_as_space: bool) -> Vec<u8> {
    let mut result = Vec::with_capacity(src.len());
    let mut i = 0;

    while i < src.len() {
        match src[i] {
            b'%' => match (hex_value(src.get(i + 1)), hex_value(src.get(i + 2))) {
                (Some(hi), Some(lo)) => {
                    result.push(hi << 4 | lo);
                    i += 3;
                    continue;
                }
                _ => result.push(b'%'),
            },
            b'+' if plus_as_space => result.push(b' '),
            byte => result.push(byte),
        }
        i += 1;
    }

    result
}

#[inline(always)]
fn hex_value(byte: Option<&u8>) -> Option<u8> {
    match byte? {
        b @ b'0'..=b'9' => Some(b - b'0'),
        b @ b'a'..=b'f' => Some(b - b'a' + 10),
        b @ b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
