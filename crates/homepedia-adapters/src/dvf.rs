//! DVF (demandes de valeurs foncières) bulk transaction dumps.
//!
//! Each year is a gzip CSV. Remote years are streamed to an anonymous temp
//! file first, then decompressed while reading.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::PathBuf;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use homepedia_core::normalize::{parse_localized_decimal, NormalizationWarning};
use homepedia_core::Source;
use homepedia_storage::HttpFetcher;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    parse_url, AdapterError, PaginationLimits, PaginationState, RawListing, RawPage,
    RecordContext, SourceAdapter, SourceConfig,
};

/// The subset of DVF columns the mapper reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DvfRow {
    pub id_mutation: String,
    pub date_mutation: String,
    pub numero_disposition: String,
    pub nature_mutation: String,
    pub valeur_fonciere: String,
    pub adresse_numero: String,
    pub adresse_suffixe: String,
    pub adresse_nom_voie: String,
    pub code_postal: String,
    pub nom_commune: String,
    pub code_departement: String,
    pub lot1_surface_carrez: String,
    pub lot2_surface_carrez: String,
    pub lot3_surface_carrez: String,
    pub lot4_surface_carrez: String,
    pub lot5_surface_carrez: String,
    pub type_local: String,
    pub surface_reelle_bati: String,
    pub nombre_pieces_principales: String,
}

impl DvfRow {
    /// Residential sales with a declared price.
    pub fn is_candidate(&self) -> bool {
        self.nature_mutation.trim() == "Vente"
            && !self.valeur_fonciere.trim().is_empty()
            && matches!(self.type_local.trim(), "Maison" | "Appartement")
    }

    /// Sum of the Carrez lot surfaces, or the built surface when no lot has one.
    /// A lot or built surface that does not parse fails the whole row.
    pub fn usable_surface(&self) -> Result<f64, NormalizationWarning> {
        let mut carrez = 0.0;
        for raw in [
            &self.lot1_surface_carrez,
            &self.lot2_surface_carrez,
            &self.lot3_surface_carrez,
            &self.lot4_surface_carrez,
            &self.lot5_surface_carrez,
        ] {
            carrez += parse_localized_decimal(raw)?.unwrap_or(0.0);
        }

        if carrez > 0.0 {
            Ok(carrez)
        } else {
            Ok(parse_localized_decimal(&self.surface_reelle_bati)?.unwrap_or(0.0))
        }
    }

    pub fn address(&self) -> String {
        [
            &self.adresse_numero,
            &self.adresse_suffixe,
            &self.adresse_nom_voie,
        ]
        .into_iter()
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
    }
}

#[derive(Debug, Clone)]
enum DumpInput {
    Remote { year: u16, url: Url },
    Local(PathBuf),
}

impl DumpInput {
    fn label(&self) -> String {
        match self {
            DumpInput::Remote { year, .. } => year.to_string(),
            DumpInput::Local(path) => path.display().to_string(),
        }
    }
}

type RowIter = csv::DeserializeRecordsIntoIter<GzDecoder<File>, DvfRow>;

pub struct DvfAdapter {
    pending: VecDeque<DumpInput>,
    current: Option<(String, RowIter)>,
    chunk_size: usize,
    state: PaginationState,
}

impl DvfAdapter {
    pub fn from_config(config: &SourceConfig, limits: PaginationLimits) -> Result<Self, AdapterError> {
        let mut pending = VecDeque::new();
        if config.local_files.is_empty() {
            let base = config.base_url.trim_end_matches('/');
            for year in &config.years {
                let url = parse_url(&format!("{base}/{year}/full.csv.gz"))?;
                pending.push_back(DumpInput::Remote { year: *year, url });
            }
        } else {
            pending.extend(config.local_files.iter().cloned().map(DumpInput::Local));
        }
        Ok(Self::new(pending, limits.chunk_size))
    }

    /// Reads pre-downloaded gzip dumps in order.
    pub fn from_local_files(files: Vec<PathBuf>, chunk_size: usize) -> Self {
        Self::new(files.into_iter().map(DumpInput::Local).collect(), chunk_size)
    }

    fn new(pending: VecDeque<DumpInput>, chunk_size: usize) -> Self {
        Self {
            pending,
            current: None,
            chunk_size: chunk_size.max(1),
            state: PaginationState::default(),
        }
    }

    /// Pulls up to `chunk_size` candidate rows from the open dump.
    fn read_chunk(&mut self) -> Vec<RawListing> {
        let mut records = Vec::new();
        let Some((label, rows)) = self.current.as_mut() else {
            return records;
        };

        while records.len() < self.chunk_size {
            match rows.next() {
                Some(Ok(row)) if row.is_candidate() => records.push(RawListing::Dvf(row)),
                Some(Ok(_)) => {}
                Some(Err(err)) if err.is_io_error() => {
                    warn!(dump = %label, error = %err, "dvf dump unreadable, skipping remainder");
                    let label = label.clone();
                    self.state.mark_incomplete(&label);
                    self.current = None;
                    return records;
                }
                Some(Err(err)) => warn!(dump = %label, error = %err, "skipping malformed dvf row"),
                None => {
                    info!(dump = %label, "dvf dump exhausted");
                    self.current = None;
                    return records;
                }
            }
        }
        records
    }
}

async fn open_dump(input: &DumpInput, http: &HttpFetcher) -> Result<File, AdapterError> {
    match input {
        DumpInput::Local(path) => File::open(path).map_err(|e| {
            AdapterError::Message(format!("opening {}: {e}", path.display()))
        }),
        DumpInput::Remote { url, .. } => {
            let scratch = tempfile::tempfile()
                .map_err(|e| AdapterError::Message(format!("creating temp file: {e}")))?;
            let mut dest = tokio::fs::File::from_std(scratch);
            let bytes = http.download_to(Source::Dvf.as_str(), url, &mut dest).await?;
            info!(%url, bytes, "dvf dump downloaded");
            let mut file = dest.into_std().await;
            file.seek(SeekFrom::Start(0))
                .map_err(|e| AdapterError::Message(format!("rewinding download: {e}")))?;
            Ok(file)
        }
    }
}

#[async_trait]
impl SourceAdapter for DvfAdapter {
    fn source(&self) -> Source {
        Source::Dvf
    }

    async fn next_page(&mut self, http: &HttpFetcher) -> Result<Option<RawPage>, AdapterError> {
        loop {
            if self.current.is_none() {
                let Some(input) = self.pending.pop_front() else {
                    return Ok(None);
                };
                let label = input.label();
                match open_dump(&input, http).await {
                    Ok(file) => {
                        let reader = csv::ReaderBuilder::new()
                            .flexible(true)
                            .from_reader(GzDecoder::new(file));
                        self.current = Some((label, reader.into_deserialize()));
                    }
                    Err(err) => {
                        warn!(dump = %label, error = %err, "dvf dump unavailable, skipping");
                        self.state.mark_incomplete(&label);
                        continue;
                    }
                }
            }

            let records = self.read_chunk();
            if records.is_empty() {
                continue;
            }

            self.state.page += 1;
            return Ok(Some(RawPage {
                context: RecordContext {
                    department: None,
                    page: self.state.page,
                },
                records,
            }));
        }
    }

    fn pagination(&self) -> &PaginationState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> DvfRow {
        DvfRow {
            id_mutation: "2023-1".into(),
            numero_disposition: "000001".into(),
            nature_mutation: "Vente".into(),
            valeur_fonciere: "250000".into(),
            type_local: "Maison".into(),
            surface_reelle_bati: "100".into(),
            ..Default::default()
        }
    }

    #[test]
    fn only_residential_sales_are_candidates() {
        assert!(row().is_candidate());
        assert!(!DvfRow { nature_mutation: "Echange".into(), ..row() }.is_candidate());
        assert!(!DvfRow { valeur_fonciere: " ".into(), ..row() }.is_candidate());
        assert!(!DvfRow { type_local: "Dépendance".into(), ..row() }.is_candidate());
    }

    #[test]
    fn carrez_lots_win_over_built_surface() {
        let with_lots = DvfRow {
            lot1_surface_carrez: "40,5".into(),
            lot3_surface_carrez: "20".into(),
            ..row()
        };
        assert_eq!(with_lots.usable_surface(), Ok(60.5));
        assert_eq!(row().usable_surface(), Ok(100.0));
        assert_eq!(DvfRow { surface_reelle_bati: String::new(), ..row() }.usable_surface(), Ok(0.0));
    }

    #[test]
    fn unreadable_carrez_lot_is_not_silently_dropped() {
        let garbled = DvfRow {
            lot1_surface_carrez: "40".into(),
            lot2_surface_carrez: "n/a".into(),
            ..row()
        };
        assert_eq!(
            garbled.usable_surface(),
            Err(NormalizationWarning::Unparseable { raw: "n/a".into() })
        );
    }

    #[test]
    fn address_skips_empty_parts() {
        let located = DvfRow {
            adresse_numero: "12".into(),
            adresse_nom_voie: "RUE DES LILAS".into(),
            ..row()
        };
        assert_eq!(located.address(), "12 RUE DES LILAS");
    }

    #[test]
    fn remote_urls_follow_the_year_layout() {
        let config = SourceConfig {
            source: Source::Dvf,
            display_name: "DVF".into(),
            enabled: true,
            base_url: "https://files.data.gouv.fr/geo-dvf/latest/csv/".into(),
            suggest_url: None,
            years: vec![2023, 2024],
            departments: Vec::new(),
            local_files: Vec::new(),
            notes: None,
        };
        let adapter = DvfAdapter::from_config(&config, PaginationLimits::default()).expect("adapter");
        let urls: Vec<String> = adapter
            .pending
            .iter()
            .map(|input| match input {
                DumpInput::Remote { url, .. } => url.to_string(),
                DumpInput::Local(path) => path.display().to_string(),
            })
            .collect();
        assert_eq!(
            urls,
            vec![
                "https://files.data.gouv.fr/geo-dvf/latest/csv/2023/full.csv.gz",
                "https://files.data.gouv.fr/geo-dvf/latest/csv/2024/full.csv.gz",
            ]
        );
    }
}
