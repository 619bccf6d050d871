//! Brazilian states and registry output formats
//!
//! Handles state code parsing, with fuzzy suggestions for mistyped codes
//! and names, and the file formats the registry can produce.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;

use crate::core::error::{Error, Result};

/// Minimum Jaro-Winkler similarity for a state name suggestion
const SUGGESTION_THRESHOLD: f64 = 0.85;

/// Federative units of Brazil, identified by their two-letter code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum State {
    AC,
    AL,
    AM,
    AP,
    BA,
    CE,
    DF,
    ES,
    GO,
    MA,
    MG,
    MS,
    MT,
    PA,
    PB,
    PE,
    PI,
    PR,
    RJ,
    RN,
    RO,
    RR,
    RS,
    SC,
    SE,
    SP,
    TO,
}

impl State {
    /// Every state, in code order
    pub const ALL: [State; 27] = [
        State::AC,
        State::AL,
        State::AM,
        State::AP,
        State::BA,
        State::CE,
        State::DF,
        State::ES,
        State::GO,
        State::MA,
        State::MG,
        State::MS,
        State::MT,
        State::PA,
        State::PB,
        State::PE,
        State::PI,
        State::PR,
        State::RJ,
        State::RN,
        State::RO,
        State::RR,
        State::RS,
        State::SC,
        State::SE,
        State::SP,
        State::TO,
    ];

    /// Two-letter code used by the registry (`sigla`)
    pub fn code(self) -> &'static str {
        match self {
            State::AC => "AC",
            State::AL => "AL",
            State::AM => "AM",
            State::AP => "AP",
            State::BA => "BA",
            State::CE => "CE",
            State::DF => "DF",
            State::ES => "ES",
            State::GO => "GO",
            State::MA => "MA",
            State::MG => "MG",
            State::MS => "MS",
            State::MT => "MT",
            State::PA => "PA",
            State::PB => "PB",
            State::PE => "PE",
            State::PI => "PI",
            State::PR => "PR",
            State::RJ => "RJ",
            State::RN => "RN",
            State::RO => "RO",
            State::RR => "RR",
            State::RS => "RS",
            State::SC => "SC",
            State::SE => "SE",
            State::SP => "SP",
            State::TO => "TO",
        }
    }

    /// Full state name
    pub fn name(self) -> &'static str {
        match self {
            State::AC => "Acre",
            State::AL => "Alagoas",
            State::AM => "Amazonas",
            State::AP => "Amapá",
            State::BA => "Bahia",
            State::CE => "Ceará",
            State::DF => "Distrito Federal",
            State::ES => "Espírito Santo",
            State::GO => "Goiás",
            State::MA => "Maranhão",
            State::MG => "Minas Gerais",
            State::MS => "Mato Grosso do Sul",
            State::MT => "Mato Grosso",
            State::PA => "Pará",
            State::PB => "Paraíba",
            State::PE => "Pernambuco",
            State::PI => "Piauí",
            State::PR => "Paraná",
            State::RJ => "Rio de Janeiro",
            State::RN => "Rio Grande do Norte",
            State::RO => "Rondônia",
            State::RR => "Roraima",
            State::RS => "Rio Grande do Sul",
            State::SC => "Santa Catarina",
            State::SE => "Sergipe",
            State::SP => "São Paulo",
            State::TO => "Tocantins",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let code = s.trim();
        State::ALL
            .into_iter()
            .find(|state| state.code().eq_ignore_ascii_case(code))
            .ok_or_else(|| Error::StateNotFound {
                input: s.to_string(),
                suggestion: suggest_state(s),
            })
    }
}

/// Lowercase, strip accents and drop everything that is not alphanumeric
fn fold(input: &str) -> String {
    input
        .chars()
        .filter_map(|c| {
            let c = match c.to_lowercase().next().unwrap_or(c) {
                'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
                'é' | 'ê' | 'è' => 'e',
                'í' | 'î' => 'i',
                'ó' | 'ô' | 'õ' | 'ö' => 'o',
                'ú' | 'ü' => 'u',
                'ç' => 'c',
                other => other,
            };
            c.is_ascii_alphanumeric().then_some(c)
        })
        .collect()
}

/// Suggest the state a mistyped code or name most likely refers to
pub fn suggest_state(input: &str) -> Option<State> {
    let folded = fold(input);
    if folded.is_empty() {
        return None;
    }

    // "PR." or " sp " are codes wrapped in noise
    if let Some(state) = State::ALL
        .into_iter()
        .find(|state| state.code().eq_ignore_ascii_case(&folded))
    {
        return Some(state);
    }

    let mut best: Option<(State, f64)> = None;
    for state in State::ALL {
        let score = jaro_winkler(&folded, &fold(state.name()));
        if best.map_or(true, |(_, best_score)| score > best_score) {
            best = Some((state, score));
        }
    }

    best.filter(|(_, score)| *score >= SUGGESTION_THRESHOLD)
        .map(|(state, _)| state)
}

/// File formats served by the registry for a municipality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Zipped shapefile
    #[default]
    Shapefile,
    /// Comma-separated values
    Csv,
}

impl OutputFormat {
    /// Path segment of the download endpoint (`/municipios/<segment>`)
    pub fn path_segment(self) -> &'static str {
        match self {
            OutputFormat::Shapefile => "shapefile",
            OutputFormat::Csv => "csv",
        }
    }

    /// Content type a successful response must announce
    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Shapefile => "application/zip",
            OutputFormat::Csv => "text/csv",
        }
    }

    /// Name of the saved file for a municipality code
    pub fn file_name(self, code: u64) -> String {
        match self {
            OutputFormat::Shapefile => format!("SHAPE_{code}.zip"),
            OutputFormat::Csv => format!("CSV_{code}.csv"),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path_segment())
    }
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shapefile" | "shp" => Ok(OutputFormat::Shapefile),
            "csv" => Ok(OutputFormat::Csv),
            other => Err(Error::InvalidInput(format!(
                "unknown output format '{other}' (expected shapefile or csv)"
            ))),
        }
    }
}
