// Data structures shared with the Cannon tooling: page encoding, pre-image
// keys, step frequencies and the runner configuration.

use base64::{engine::general_purpose, Engine as _};

use libflate::zlib::{Decoder, Encoder};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{de, ser, Deserialize, Deserializer, Serialize, Serializer};
use std::{
    io::{Read, Write},
    str::FromStr,
};
use strum_macros::EnumString;

pub const PAGE_ADDRESS_SIZE: u32 = 12;
pub const PAGE_SIZE: u32 = 1 << PAGE_ADDRESS_SIZE;
pub const PAGE_ADDRESS_MASK: u32 = PAGE_SIZE - 1;

/// A page as stored in JSON state files: its index and its 4096 bytes,
/// zlib-compressed then base64-encoded.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Page {
    pub index: u32,
    #[serde(deserialize_with = "from_base64", serialize_with = "to_base64")]
    pub data: Vec<u8>,
}

fn from_base64<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    let b64_decoded = general_purpose::STANDARD
        .decode(s)
        .map_err(de::Error::custom)?;
    let mut decoder = Decoder::new(&b64_decoded[..]).map_err(de::Error::custom)?;
    let mut data = Vec::new();
    decoder
        .read_to_end(&mut data)
        .map_err(de::Error::custom)?;
    if data.len() != PAGE_SIZE as usize {
        return Err(de::Error::custom(format!(
            "page data is {} bytes long, expected {PAGE_SIZE}",
            data.len()
        )));
    }
    Ok(data)
}

fn to_base64<S>(v: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut encoder = Encoder::new(Vec::new()).map_err(ser::Error::custom)?;
    encoder.write_all(v).map_err(ser::Error::custom)?;
    let res = encoder
        .finish()
        .into_result()
        .map_err(ser::Error::custom)?;
    serializer.serialize_str(&general_purpose::STANDARD.encode(res))
}

pub fn deserialize_preimage_key<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    PreimageKey::from_str(s.as_str())
        .map(|p| p.0)
        .map_err(|ParsePreimageKeyError(e)| de::Error::custom(e))
}

pub fn serialize_preimage_key<S>(v: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format!("0x{}", hex::encode(v)))
}

/// `0x`-prefixed hex encoding of arbitrary bytes, as used for hints and
/// witness data.
pub fn deserialize_hex_bytes<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    hex::decode(s.trim_start_matches("0x")).map_err(de::Error::custom)
}

pub fn serialize_hex_bytes<S>(v: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format!("0x{}", hex::encode(v)))
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParsePreimageKeyError(String);

#[derive(Debug, PartialEq)]
pub struct PreimageKey(pub [u8; 32]);

impl FromStr for PreimageKey {
    type Err = ParsePreimageKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex_value = s.strip_prefix("0x").unwrap_or(s);
        // Exactly 32 bytes, no auto-padding
        if hex_value.len() != 64 {
            return Err(ParsePreimageKeyError(format!(
                "{hex_value} is not 32-bytes long"
            )));
        }
        let bytes = hex::decode(hex_value)
            .map_err(|_| ParsePreimageKeyError(format!("Could not hex decode {hex_value}")))?;
        bytes.try_into().map(PreimageKey).map_err(|h: Vec<u8>| {
            ParsePreimageKeyError(format!("Could not cast vector {h:?} into 32 bytes array"))
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum StepFrequency {
    Never,
    Always,
    Exactly(u64),
    Every(u64),
    Range(u64, Option<u64>),
}

static MOD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^%([0-9]+)$").expect("valid regex"));
static EQ_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^=([0-9]+)$").expect("valid regex"));
static IVAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9]+)\.\.([0-9]+)?$").expect("valid regex"));

impl FromStr for StepFrequency {
    type Err = String;
    // Accepted forms: `never`, `always`, `=N` (step N only), `%N` (steps
    // divisible by N), `N..` and `N..M` (M excluded)
    fn from_str(s: &str) -> std::result::Result<StepFrequency, String> {
        use StepFrequency::*;

        let parse = |v: &str| {
            v.parse::<u64>()
                .map_err(|e| format!("Invalid step {v} in frequency {s}: {e}"))
        };

        match s {
            "never" => Ok(Never),
            "always" => Ok(Always),
            s => {
                if let Some(m) = MOD_RE.captures(s) {
                    Ok(Every(parse(&m[1])?))
                } else if let Some(m) = EQ_RE.captures(s) {
                    Ok(Exactly(parse(&m[1])?))
                } else if let Some(m) = IVAL_RE.captures(s) {
                    let lo = parse(&m[1])?;
                    let hi_opt = m.get(2).map(|x| parse(x.as_str())).transpose()?;
                    Ok(Range(lo, hi_opt))
                } else {
                    Err(format!("Unknown frequency format {s}"))
                }
            }
        }
    }
}

impl StepFrequency {
    pub fn matches(&self, step: u64) -> bool {
        use StepFrequency::*;
        match self {
            Never => false,
            Always => true,
            Exactly(n) => step == *n,
            Every(0) => false,
            Every(n) => step % n == 0,
            Range(lo, None) => step >= *lo,
            Range(lo, Some(hi)) => step >= *lo && step < *hi,
        }
    }
}

/// Kinds of pre-image keys, named by their first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum PreimageKeyType {
    Local = 1,
    Keccak = 2,
    Sha256 = 4,
    Blob = 5,
    Precompile = 6,
}

/// Pre-image reads the runner stops after.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PreimageStop {
    #[default]
    Never,
    Any,
    /// A read of a key starting with `prefix`, from `offset` in the
    /// length-prefixed pre-image.
    Key { prefix: Vec<u8>, offset: u32 },
}

impl PreimageStop {
    /// Parse `<hex key prefix>[@<offset>]`. An odd number of hex digits is
    /// padded with a leading zero.
    pub fn parse_key(s: &str) -> Result<PreimageStop, String> {
        let (key, offset) = match s.split_once('@') {
            Some((key, offset)) => {
                let offset = offset
                    .parse::<u32>()
                    .map_err(|e| format!("Invalid pre-image offset {offset}: {e}"))?;
                (key, offset)
            }
            None => (s, 0),
        };
        let digits = key.strip_prefix("0x").unwrap_or(key);
        let digits = if digits.len() % 2 == 1 {
            format!("0{digits}")
        } else {
            digits.to_string()
        };
        let prefix =
            hex::decode(&digits).map_err(|e| format!("Invalid pre-image key {key}: {e}"))?;
        if prefix.is_empty() || prefix.len() > 32 {
            return Err(format!("Pre-image key prefix {key} must be 1 to 32 bytes long"));
        }
        Ok(PreimageStop::Key { prefix, offset })
    }

    /// Parse a key type name, or `any`. A type matches reads starting at
    /// offset 0.
    pub fn parse_type(s: &str) -> Result<PreimageStop, String> {
        if s == "any" {
            return Ok(PreimageStop::Any);
        }
        let key_type = PreimageKeyType::from_str(s)
            .map_err(|_| format!("Invalid pre-image type {s:?}"))?;
        Ok(PreimageStop::Key {
            prefix: vec![key_type as u8],
            offset: 0,
        })
    }

    pub fn matches(&self, key: &[u8; 32], offset: u32) -> bool {
        match self {
            PreimageStop::Never => false,
            PreimageStop::Any => true,
            PreimageStop::Key {
                prefix,
                offset: at,
            } => key.starts_with(prefix) && offset == *at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostProgram {
    pub name: String,
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct VmConfiguration {
    pub input_state_file: String,
    pub output_state_file: String,
    pub metadata_file: Option<String>,
    pub proof_at: StepFrequency,
    pub stop_at: StepFrequency,
    pub snapshot_state_at: StepFrequency,
    pub info_at: StepFrequency,
    pub stop_at_preimage: PreimageStop,
    /// Stop after reading a pre-image larger than this many bytes.
    pub stop_at_preimage_larger_than: Option<usize>,
    pub proof_fmt: String,
    pub snapshot_fmt: String,
    pub host: Option<HostProgram>,
}

impl Default for VmConfiguration {
    fn default() -> Self {
        VmConfiguration {
            input_state_file: "state.json".to_string(),
            output_state_file: "out.json".to_string(),
            metadata_file: None,
            proof_at: StepFrequency::Never,
            stop_at: StepFrequency::Never,
            snapshot_state_at: StepFrequency::Never,
            info_at: StepFrequency::Never,
            stop_at_preimage: PreimageStop::Never,
            stop_at_preimage_larger_than: None,
            proof_fmt: "proof-%d.json".to_string(),
            snapshot_fmt: "state-%d.json".to_string(),
            host: None,
        }
    }
}

/// Replace `%d` in a file name pattern by `step`.
pub fn format_step_file(fmt: &str, step: u64) -> String {
    fmt.replace("%d", &step.to_string())
}

/// Reference point used to report the number of instructions per second.
#[derive(Debug, Clone)]
pub struct Start {
    pub time: std::time::Instant,
    pub step: u64,
}

impl Start {
    pub fn create(step: u64) -> Start {
        Start {
            time: std::time::Instant::now(),
            step,
        }
    }
}

pub const FD_STDIN: u32 = 0;
pub const FD_STDOUT: u32 = 1;
pub const FD_STDERR: u32 = 2;
pub const FD_HINT_READ: u32 = 3;
pub const FD_HINT_WRITE: u32 = 4;
pub const FD_PREIMAGE_READ: u32 = 5;
pub const FD_PREIMAGE_WRITE: u32 = 6;

// Host side of the channels, as seen by the pre-image server.
pub const HINT_CLIENT_READ_FD: i32 = 3;
pub const HINT_CLIENT_WRITE_FD: i32 = 4;
pub const PREIMAGE_CLIENT_READ_FD: i32 = 5;
pub const PREIMAGE_CLIENT_WRITE_FD: i32 = 6;

pub struct Preimage(Vec<u8>);

impl Preimage {
    pub fn create(v: Vec<u8>) -> Self {
        Preimage(v)
    }

    pub fn get(self) -> Vec<u8> {
        self.0
    }
}

pub struct Hint(Vec<u8>);

impl Hint {
    pub fn create(v: Vec<u8>) -> Self {
        Hint(v)
    }

    pub fn get(self) -> Vec<u8> {
        self.0
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_parse_preimage_stop() {
        assert_eq!(
            PreimageStop::parse_key("0x02ab@16"),
            Ok(PreimageStop::Key {
                prefix: vec![0x02, 0xAB],
                offset: 16
            })
        );
        assert_eq!(
            PreimageStop::parse_key("2ab"),
            Ok(PreimageStop::Key {
                prefix: vec![0x02, 0xAB],
                offset: 0
            })
        );
        assert!(PreimageStop::parse_key("0x").is_err());
        assert!(PreimageStop::parse_key("zz").is_err());
        assert!(PreimageStop::parse_key("02@x").is_err());
        assert!(PreimageStop::parse_key(&"ab".repeat(33)).is_err());

        assert_eq!(PreimageStop::parse_type("any"), Ok(PreimageStop::Any));
        assert_eq!(
            PreimageStop::parse_type("sha256"),
            Ok(PreimageStop::Key {
                prefix: vec![4],
                offset: 0
            })
        );
        assert!(PreimageStop::parse_type("generic").is_err());
    }

    #[test]
    fn test_preimage_stop_matches() {
        let mut key = [0u8; 32];
        key[0] = 2;
        key[1] = 0xAB;
        let stop = PreimageStop::parse_key("0x02ab@8").unwrap();
        assert!(stop.matches(&key, 8));
        assert!(!stop.matches(&key, 0));
        key[1] = 0xAC;
        assert!(!stop.matches(&key, 8));

        assert!(PreimageStop::Any.matches(&key, 123));
        assert!(!PreimageStop::Never.matches(&key, 0));
        assert!(PreimageStop::parse_type("keccak").unwrap().matches(&key, 0));
        assert!(!PreimageStop::parse_type("local").unwrap().matches(&key, 0));
    }

    #[test]
    fn test_parse_step_frequency() {
        use StepFrequency::*;
        assert_eq!(StepFrequency::from_str("never"), Ok(Never));
        assert_eq!(StepFrequency::from_str("always"), Ok(Always));
        assert_eq!(StepFrequency::from_str("=123"), Ok(Exactly(123)));
        assert_eq!(StepFrequency::from_str("%123"), Ok(Every(123)));
        assert_eq!(StepFrequency::from_str("1..3"), Ok(Range(1, Some(3))));
        assert_eq!(StepFrequency::from_str("1.."), Ok(Range(1, None)));
        assert!(StepFrequency::from_str("@123").is_err());
        assert!(StepFrequency::from_str("=99999999999999999999999").is_err());
    }

    #[test]
    fn test_step_frequency_matches() {
        use StepFrequency::*;
        assert!(!Never.matches(0));
        assert!(Always.matches(17));
        assert!(Exactly(5).matches(5));
        assert!(!Exactly(5).matches(6));
        assert!(Every(10).matches(0));
        assert!(Every(10).matches(30));
        assert!(!Every(10).matches(31));
        assert!(!Every(0).matches(0));
        assert!(Range(3, None).matches(1_000_000));
        assert!(!Range(3, None).matches(2));
        assert!(Range(3, Some(5)).matches(4));
        assert!(!Range(3, Some(5)).matches(5));
    }

    #[test]
    fn test_format_step_file() {
        assert_eq!(format_step_file("proof-%d.json", 42), "proof-42.json");
        assert_eq!(format_step_file("out.json", 42), "out.json");
    }

    #[test]
    fn test_serialize_deserialize_page() {
        let value: &str = r#"{"index":16,"data":"eJztlkFoE0EUht8k21ZEtFYFg1FCTW0qSGoTS6pFJU3TFlNI07TEQJHE1kJMmhwi1ihaRJCqiAdBKR5Ez4IXvQk5eBaP4iEWpAchV0Hoof5vd14SoQcvve0H/5s3O//OzuzMLHtvNBZVDkUNHLQLUdHugSTKINJgnDoNZB60+MhFBq63Q0G4LCFYQptZoKR9r0hpEc1r4bopy8WRtdptmCJqM+t89RHiY60Xc39M8b26XXUjHLdEbf4qdTyMIWvn9vnyxhTy7eBxGwvGoRWU23ASIqNE5MT4H2DslogOa/EY+f38LxiNKYyrEwW02sV9CJLfgdjnMOfLc0+6biMKHohJFLe2fqO0qLl4Hui0AfcB1H0EzEFTc73GtSfIBO0jnhvnDvpx5CLVIJoKoS7Ic59C2pdfoRpEe+KoC+J7CWnf8leqQf/CbcwbiHP2rcO3TuENfr+C9HcGYp+T15nXnMjdOl/JOyDtc3tUt9tDzto31AXprwuyfCc2SfVsohZ8j7ogPh4Lr7NT+fxV1Yv9pXJ11AXxHYUsX99aVfnWqkT11vcsvk8QnstWJD4EUr0Igt4HqodD0wdP59kIUkH76DvU9IXOXSfnr0tIBe1T5zlAJmrY+xHFICRIG+8p5Lq/YW+djt1tfX/S314ODV/67Wc6eOEZUkF8CxwavqWfSWo/9QWpoH2UhXjtHDhn+E6wzO+EIL4RnEk+nOzDnmWZayRYDyJ6BzkgE3Vjv5faYrjV9F6DuD/eMx+gxvlQlbnndMDdh1TA2G1sbGxsbGxsbGx2Co9Sqvk/2gL/r05DxlgRP8bZK0O50cJQPjMxO5HKhCOlQr8/sVy5uRTuD5RGKuXFaDgYSQ+E/LOlsZlEIZ8NBqKlcmby8mIpPOjPpWYmxwPF06lI+mpqPB+O35ou0l+FGHpe"}"#;
        let decoded_page: Page = serde_json::from_str(value).unwrap();
        assert_eq!(decoded_page.index, 16);
        assert_eq!(decoded_page.data.len(), PAGE_SIZE as usize);
        let res = serde_json::to_string(&decoded_page).unwrap();
        assert_eq!(res, value);
    }

    #[test]
    fn test_page_with_wrong_size_is_rejected() {
        let mut encoder = Encoder::new(Vec::new()).unwrap();
        encoder.write_all(&[0u8; 16]).unwrap();
        let compressed = encoder.finish().into_result().unwrap();
        let value = format!(
            r#"{{"index":0,"data":"{}"}}"#,
            general_purpose::STANDARD.encode(compressed)
        );
        assert!(serde_json::from_str::<Page>(&value).is_err());
        assert!(serde_json::from_str::<Page>(r#"{"index":0,"data":"%%%"}"#).is_err());
    }

    #[test]
    fn test_preimage_key_serialisation() {
        #[derive(Serialize, Deserialize)]
        struct TestPreimageKeyStruct {
            #[serde(
                rename = "preimageKey",
                deserialize_with = "deserialize_preimage_key",
                serialize_with = "serialize_preimage_key"
            )]
            pub preimage_key: [u8; 32],
        }

        let preimage_key: &str = r#"{"preimageKey":"0x0000000000000000000000000000000000000000000000000000000000000000"}"#;
        let s: TestPreimageKeyStruct = serde_json::from_str(preimage_key).unwrap();
        let res = serde_json::to_string(&s).unwrap();
        assert_eq!(preimage_key, res);

        let bad = r#"{"preimageKey":"0x00"}"#;
        assert!(serde_json::from_str::<TestPreimageKeyStruct>(bad).is_err());
    }

    #[test]
    fn test_parse_preimagekey() {
        assert_eq!(
            PreimageKey::from_str(
                "0x0000000000000000000000000000000000000000000000000000000000000000"
            ),
            Ok(PreimageKey([0; 32]))
        );
        let mut one = [0u8; 32];
        one[31] = 1;
        assert_eq!(
            PreimageKey::from_str(
                "0000000000000000000000000000000000000000000000000000000000000001"
            ),
            Ok(PreimageKey(one))
        );
        assert!(PreimageKey::from_str("0x01").is_err());
        assert!(PreimageKey::from_str(
            "0xzz00000000000000000000000000000000000000000000000000000000000000"
        )
        .is_err());
    }
}
