//! # Dictionary-Aware Compression Codec
//!
//! A software LZ codec in the LZ4 framing tradition, extended with trained
//! dictionaries: the dictionary bytes are prepended to the match window, so
//! short entries that share structure with the dictionary compress far below
//! what a 300-byte window alone could reach.
//!
//! ## Stream Format
//!
//! ```text
//! [raw_len: u32 LE][sequence]...[final sequence]
//!
//! sequence:
//!   token: u8            high nibble = literal length (15 = extended)
//!                        low nibble  = match length - 4 (15 = extended)
//!   [literal length extension: 255-continuation bytes]
//!   literal bytes
//!   offset: u16 LE       distance back into dict ++ output (>= 1)
//!   [match length extension: 255-continuation bytes]
//! ```
//!
//! The final sequence ends after its literals; a decoder that exhausts the
//! input right after copying literals is done. `raw_len` is authoritative:
//! decompression verifies the decoded length against it and fails on
//! mismatch, which is how torn or misattributed streams surface.
//!
//! ## Dictionary Semantics
//!
//! Compression and decompression both treat `dict ++ data` as one virtual
//! buffer; offsets may reach back into the dictionary region. A stream
//! compressed against dictionary D decodes only against D — the engine keys
//! every stored stream to the 32-byte hash of its dictionary for exactly
//! this reason.
//!
//! ## Training
//!
//! `train` builds a dictionary from sample entries by keeping the most
//! recent `max_size` bytes of the concatenated corpus. Match candidates are
//! position-independent, so recency is a fine proxy for usefulness and the
//! trainer stays allocation-bounded.

use eyre::{ensure, Result};

/// Hash-table size for match candidates, as a power of two.
const HASH_BITS: u32 = 13;

const MIN_MATCH: usize = 4;
const MAX_OFFSET: usize = u16::MAX as usize;

/// Worst-case compressed size for `n` raw bytes.
pub fn max_compressed_bound(n: usize) -> usize {
    4 + n + n / 255 + 16
}

/// Raw length recorded in a compressed stream.
pub fn decompressed_size(src: &[u8]) -> Result<usize> {
    ensure!(
        src.len() >= 4,
        "compressed stream too short: {} bytes",
        src.len()
    );
    Ok(u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize)
}

/// Ceiling percentage of `compressed` relative to `raw`. The engine's
/// "compression ratio": lower is better, 100 means no gain.
pub fn ratio_percent(compressed: usize, raw: usize) -> i32 {
    if raw == 0 {
        return 100;
    }
    ((compressed * 100).div_ceil(raw)) as i32
}

#[inline]
fn hash4(bytes: &[u8]) -> usize {
    let v = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    (v.wrapping_mul(2654435761) >> (32 - HASH_BITS)) as usize
}

fn put_length(out: &mut Vec<u8>, mut rem: usize) {
    while rem >= 255 {
        out.push(255);
        rem -= 255;
    }
    out.push(rem as u8);
}

fn emit_sequence(out: &mut Vec<u8>, literals: &[u8], offset: u16, match_len: usize) {
    debug_assert!(match_len >= MIN_MATCH);
    let lit_nibble = literals.len().min(15);
    let match_bias = match_len - MIN_MATCH;
    let match_nibble = match_bias.min(15);
    out.push(((lit_nibble as u8) << 4) | match_nibble as u8);
    if lit_nibble == 15 {
        put_length(out, literals.len() - 15);
    }
    out.extend_from_slice(literals);
    out.extend_from_slice(&offset.to_le_bytes());
    if match_nibble == 15 {
        put_length(out, match_bias - 15);
    }
}

fn emit_trailing_literals(out: &mut Vec<u8>, literals: &[u8]) {
    if literals.is_empty() {
        return;
    }
    let lit_nibble = literals.len().min(15);
    out.push((lit_nibble as u8) << 4);
    if lit_nibble == 15 {
        put_length(out, literals.len() - 15);
    }
    out.extend_from_slice(literals);
}

/// Compresses `src` against an optional dictionary. The output always
/// carries the 4-byte raw-length header, even for incompressible input.
pub fn compress(src: &[u8], dict: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(max_compressed_bound(src.len()));
    out.extend_from_slice(&(src.len() as u32).to_le_bytes());
    if src.is_empty() {
        return out;
    }

    let base = dict.len();
    let mut virt = Vec::with_capacity(base + src.len());
    virt.extend_from_slice(dict);
    virt.extend_from_slice(src);

    let mut table = vec![u32::MAX; 1 << HASH_BITS];
    for i in 0..base.saturating_sub(MIN_MATCH - 1) {
        table[hash4(&virt[i..i + MIN_MATCH])] = i as u32;
    }

    let end = virt.len();
    let mut i = base;
    let mut lit_start = base;

    while i + MIN_MATCH <= end {
        let h = hash4(&virt[i..i + MIN_MATCH]);
        let cand = table[h];
        table[h] = i as u32;

        if cand != u32::MAX {
            let c = cand as usize;
            let offset = i - c;
            if offset >= 1 && offset <= MAX_OFFSET && virt[c..c + MIN_MATCH] == virt[i..i + MIN_MATCH]
            {
                let mut len = MIN_MATCH;
                while i + len < end && virt[c + len] == virt[i + len] {
                    len += 1;
                }
                emit_sequence(&mut out, &virt[lit_start..i], offset as u16, len);
                i += len;
                lit_start = i;
                continue;
            }
        }
        i += 1;
    }

    emit_trailing_literals(&mut out, &virt[lit_start..end]);
    out
}

fn read_length(src: &[u8], p: &mut usize, seed: usize) -> Result<usize> {
    let mut len = seed;
    if seed == 15 {
        loop {
            ensure!(*p < src.len(), "truncated length in compressed stream");
            let b = src[*p];
            *p += 1;
            len += b as usize;
            if b != 255 {
                break;
            }
        }
    }
    Ok(len)
}

/// Decompresses a stream produced by [`compress`] against the same
/// dictionary. Fails when the decoded length disagrees with the stream's
/// recorded raw length.
pub fn decompress(src: &[u8], dict: &[u8]) -> Result<Vec<u8>> {
    let raw_len = decompressed_size(src)?;
    let mut out: Vec<u8> = Vec::with_capacity(raw_len);
    let mut p = 4usize;

    while p < src.len() {
        let token = src[p];
        p += 1;

        let lit_len = read_length(src, &mut p, (token >> 4) as usize)?;
        ensure!(
            p + lit_len <= src.len(),
            "truncated literals in compressed stream"
        );
        out.extend_from_slice(&src[p..p + lit_len]);
        p += lit_len;

        if p >= src.len() {
            break;
        }

        ensure!(p + 2 <= src.len(), "truncated offset in compressed stream");
        let offset = u16::from_le_bytes([src[p], src[p + 1]]) as usize;
        p += 2;
        ensure!(offset >= 1, "zero match offset in compressed stream");

        let match_len = MIN_MATCH + read_length(src, &mut p, (token & 0x0F) as usize)?;

        let vpos = dict.len() + out.len();
        ensure!(
            offset <= vpos,
            "match offset {} reaches before stream start",
            offset
        );
        let start = vpos - offset;
        for k in 0..match_len {
            let idx = start + k;
            let byte = if idx < dict.len() {
                dict[idx]
            } else {
                out[idx - dict.len()]
            };
            out.push(byte);
        }
    }

    ensure!(
        out.len() == raw_len,
        "decompressed size mismatch: {} != {}",
        out.len(),
        raw_len
    );
    Ok(out)
}

/// Builds a dictionary of at most `max_size` bytes from sample entries.
pub fn train(samples: &[&[u8]], max_size: usize) -> Vec<u8> {
    let mut dict = Vec::new();
    for sample in samples {
        dict.extend_from_slice(sample);
    }
    if dict.len() > max_size {
        dict.drain(..dict.len() - max_size);
    }
    dict
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json(i: usize) -> Vec<u8> {
        format!(
            "{{\"user\":\"user-{:04}\",\"status\":\"active\",\"region\":\"eu-west\",\"score\":{}}}",
            i,
            i * 3
        )
        .into_bytes()
    }

    #[test]
    fn roundtrip_without_dictionary() {
        for data in [
            b"".to_vec(),
            b"a".to_vec(),
            b"abcdabcdabcdabcd".to_vec(),
            vec![0u8; 10_000],
            (0..5000u32).flat_map(|i| i.to_le_bytes()).collect(),
        ] {
            let compressed = compress(&data, &[]);
            assert_eq!(decompressed_size(&compressed).unwrap(), data.len());
            assert_eq!(decompress(&compressed, &[]).unwrap(), data);
        }
    }

    #[test]
    fn roundtrip_with_dictionary() {
        let dict = train(
            &(0..32).map(sample_json).collect::<Vec<_>>().iter().map(|v| v.as_slice()).collect::<Vec<_>>(),
            4096,
        );
        for i in 100..110 {
            let data = sample_json(i);
            let compressed = compress(&data, &dict);
            assert_eq!(decompress(&compressed, &dict).unwrap(), data);
        }
    }

    #[test]
    fn dictionary_improves_short_entry_ratio() {
        let samples: Vec<Vec<u8>> = (0..64).map(sample_json).collect();
        let refs: Vec<&[u8]> = samples.iter().map(|v| v.as_slice()).collect();
        let dict = train(&refs, 4096);

        let probe = sample_json(999);
        let bare = compress(&probe, &[]);
        let with_dict = compress(&probe, &dict);
        assert!(
            with_dict.len() < bare.len(),
            "dictionary should help: {} >= {}",
            with_dict.len(),
            bare.len()
        );
    }

    #[test]
    fn wrong_dictionary_fails_or_differs() {
        let dict_a = train(&[b"alpha beta gamma delta".as_slice()], 4096);
        let dict_b = train(&[b"0123456789 9876543210!".as_slice()], 4096);
        let data = b"alpha beta gamma delta alpha beta gamma delta";

        let compressed = compress(data, &dict_a);
        match decompress(&compressed, &dict_b) {
            Ok(decoded) => assert_ne!(decoded, data),
            Err(_) => {}
        }
    }

    #[test]
    fn size_mismatch_is_detected() {
        let data = b"repeat repeat repeat repeat repeat";
        let mut compressed = compress(data, &[]);
        compressed[0] = compressed[0].wrapping_add(1);
        let err = decompress(&compressed, &[]).unwrap_err();
        assert!(err.to_string().contains("size mismatch"));
    }

    #[test]
    fn long_literal_runs_use_extended_lengths() {
        let data: Vec<u8> = (0..1000u32)
            .flat_map(|i| i.wrapping_mul(2654435761).to_le_bytes())
            .collect();
        let compressed = compress(&data, &[]);
        assert_eq!(decompress(&compressed, &[]).unwrap(), data);
    }

    #[test]
    fn overlapping_match_copies_forward() {
        let mut data = b"ab".to_vec();
        data.extend(std::iter::repeat(b'x').take(300));
        let compressed = compress(&data, &[]);
        assert_eq!(decompress(&compressed, &[]).unwrap(), data);
    }

    #[test]
    fn ratio_percent_rounds_up() {
        assert_eq!(ratio_percent(50, 100), 50);
        assert_eq!(ratio_percent(1, 3), 34);
        assert_eq!(ratio_percent(0, 100), 0);
        assert_eq!(ratio_percent(10, 0), 100);
    }

    #[test]
    fn train_keeps_most_recent_bytes() {
        let a = vec![1u8; 3000];
        let b = vec![2u8; 3000];
        let dict = train(&[a.as_slice(), b.as_slice()], 4096);
        assert_eq!(dict.len(), 4096);
        assert!(dict[4095] == 2 && dict[0] == 1);
    }
}
