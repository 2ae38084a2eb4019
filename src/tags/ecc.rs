//! The mini-ECC protecting tag words: an extended Hamming (72,64) code.
//!
//! Each 64-bit word gets one ECC byte. Bits 0..7 of that byte are the Hamming parity bits (codeword
//! positions 1, 2, 4, .., 64), and bit 7 is the overall parity of the whole 72-bit codeword. Data
//! bits occupy the remaining codeword positions 3, 5, 6, 7, 9, .. 71 in order. A single flipped bit
//! anywhere (data or ECC byte) is corrected; any two flipped bits are detected.

/// Outcome of checking a protected region
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Copy, Clone)]
pub enum CorrectionResult {
    NoError,
    Fixed,
    Unfixed,
}

/// Codeword position of each data bit
const DATA_POSITIONS: [u8; 64] = {
    let mut positions = [0u8; 64];
    let mut pos = 1u8;
    let mut bit = 0;
    while bit < 64 {
        if !pos.is_power_of_two() {
            positions[bit] = pos;
            bit += 1;
        }
        pos += 1;
    }
    positions
};

/// Inverse of `DATA_POSITIONS`; 0xFF where a position holds no data bit
const POSITION_BITS: [u8; 128] = {
    let mut bits = [0xFFu8; 128];
    let mut bit = 0;
    while bit < 64 {
        bits[DATA_POSITIONS[bit] as usize] = bit as u8;
        bit += 1;
    }
    bits
};

fn hamming_parity(word: u64) -> u8 {
    let mut syndrome = 0u8;
    let mut bits = word;
    while bits != 0 {
        let bit = bits.trailing_zeros();
        syndrome ^= DATA_POSITIONS[bit as usize];
        bits &= bits - 1;
    }
    syndrome
}

/// Compute the ECC byte for a word
pub fn calc_ecc(word: u64) -> u8 {
    let parity = hamming_parity(word);
    let overall = (word.count_ones() + parity.count_ones()) & 1;
    parity | (overall as u8) << 7
}

/// Check a word against its ECC byte, correcting a single-bit error in either of them in place
pub fn check_ecc(word: &mut u64, ecc: &mut u8) -> CorrectionResult {
    let syndrome = hamming_parity(*word) ^ (*ecc & 0x7F);
    let overall_odd = (word.count_ones() + ecc.count_ones()) & 1 == 1;

    match (syndrome, overall_odd) {
        (0, false) => CorrectionResult::NoError,

        // An even number of flips with a nonzero syndrome can't be located
        (_, false) => CorrectionResult::Unfixed,

        // The overall parity bit itself flipped
        (0, true) => {
            *ecc ^= 0x80;
            CorrectionResult::Fixed
        }

        // One of the Hamming parity bits flipped
        (s, true) if s.is_power_of_two() => {
            *ecc ^= s;
            CorrectionResult::Fixed
        }

        (s, true) => match POSITION_BITS[s as usize] {
            0xFF => CorrectionResult::Unfixed,
            bit => {
                *word ^= 1 << bit;
                CorrectionResult::Fixed
            }
        },
    }
}

#[test]
fn test_positions_cover_codeword() {
    assert_eq!(DATA_POSITIONS[0], 3);
    assert_eq!(DATA_POSITIONS[63], 71);
    assert!(DATA_POSITIONS.iter().all(|p| !p.is_power_of_two()));
}

#[test]
fn test_clean_word() {
    let mut word = 0x0123_4567_89AB_CDEFu64;
    let mut ecc = calc_ecc(word);
    assert_eq!(check_ecc(&mut word, &mut ecc), CorrectionResult::NoError);
}

#[test]
fn test_every_single_flip_is_fixed() {
    let original = 0xDEAD_BEEF_0BAD_F00Du64;
    let original_ecc = calc_ecc(original);

    for bit in 0..72 {
        let (mut word, mut ecc) = (original, original_ecc);
        if bit < 64 {
            word ^= 1 << bit;
        } else {
            ecc ^= 1 << (bit - 64);
        }
        assert_eq!(check_ecc(&mut word, &mut ecc), CorrectionResult::Fixed);
        assert_eq!((word, ecc), (original, original_ecc));
    }
}

#[test]
fn test_double_flips_are_detected() {
    let original = 0x5555_AAAA_0000_FFFFu64;
    let original_ecc = calc_ecc(original);

    for a in 0..72 {
        for b in (a + 1)..72 {
            let (mut word, mut ecc) = (original, original_ecc);
            for bit in [a, b] {
                if bit < 64 {
                    word ^= 1 << bit;
                } else {
                    ecc ^= 1 << (bit - 64);
                }
            }
            assert_eq!(check_ecc(&mut word, &mut ecc), CorrectionResult::Unfixed);
        }
    }
}
