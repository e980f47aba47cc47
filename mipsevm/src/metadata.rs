use serde::{Deserialize, Deserializer};
use std::{cmp::Ordering, fs::File, io::BufReader, path::Path};

#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub start: u32,
    pub size: usize,
}

/// Symbol table of the loaded program, used to name the function being
/// executed in progress reports.
#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct Meta {
    #[serde(deserialize_with = "filtered_ordered")]
    pub symbols: Vec<Symbol>, // Needs to be in ascending order w.r.t start address
}

// Deserialized symbols are sorted by ascending start address, 0-size symbols
// are removed
fn filtered_ordered<'de, D>(deserializer: D) -> Result<Vec<Symbol>, D::Error>
where
    D: Deserializer<'de>,
{
    let v: Vec<Symbol> = Deserialize::deserialize(deserializer)?;
    let mut filtered: Vec<Symbol> = v.into_iter().filter(|e| e.size != 0).collect();
    filtered.sort_by(|a, b| a.start.cmp(&b.start));
    Ok(filtered)
}

impl Meta {
    pub fn from_file<P: AsRef<Path>>(path: P) -> std::io::Result<Meta> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn find_address_symbol(&self, address: u32) -> Option<String> {
        self.symbols
            .binary_search_by(|Symbol { start, size, .. }| {
                if address < *start {
                    Ordering::Greater
                } else if (address as u64) >= *start as u64 + *size as u64 {
                    Ordering::Less
                } else {
                    Ordering::Equal
                }
            })
            .ok()
            .map(|idx| self.symbols[idx].name.clone())
    }
}
