use std::collections::BTreeMap;

use aegis_schemas::{Instrument, Sector};

/// Maps every traded instrument to a sector for the sector-exposure check
/// (check 5). An instrument absent from the table defaults to
/// [`Sector::default_crypto`] rather than failing — the source system
/// trades a single-sector universe today, and this keeps that assumption
/// from becoming a hard requirement.
#[derive(Clone, Debug, Default)]
pub struct SectorTable(BTreeMap<Instrument, Sector>);

impl SectorTable {
    pub fn new() -> Self {
        SectorTable(BTreeMap::new())
    }

    pub fn set(&mut self, instrument: Instrument, sector: Sector) {
        self.0.insert(instrument, sector);
    }

    pub fn get(&self, instrument: &Instrument) -> Sector {
        self.0.get(instrument).cloned().unwrap_or_else(Sector::default_crypto)
    }
}

impl FromIterator<(Instrument, Sector)> for SectorTable {
    fn from_iter<I: IntoIterator<Item = (Instrument, Sector)>>(iter: I) -> Self {
        SectorTable(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_instrument_defaults_to_crypto() {
        let table = SectorTable::new();
        assert_eq!(table.get(&Instrument::new("BTCZAR")), Sector::default_crypto());
    }

    #[test]
    fn mapped_instrument_overrides_default() {
        let mut table = SectorTable::new();
        table.set(Instrument::new("TSLA"), Sector::new("equities"));
        assert_eq!(table.get(&Instrument::new("TSLA")), Sector::new("equities"));
        assert_eq!(table.get(&Instrument::new("BTCZAR")), Sector::default_crypto());
    }
}
