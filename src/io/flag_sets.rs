use crate::core::flags::{FlagDefinition, FlagSet, LadderCodes};
use crate::types::{FlagCode, QcError, QcResult, Rgba};
use quick_xml::de::from_str;
use quick_xml::se::to_string;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// XML layout of a QC set definition file
///
/// ```xml
/// <qcSet>
///   <id>1</id>
///   <name>IMOS standard flags</name>
///   <ladder><raw>0</raw><good>1</good>...</ladder>
///   <flag><code>0</code><name>No QC performed</name><severityRank>0</severityRank><color>#bfbfbfff</color></flag>
///   ...
/// </qcSet>
/// ```
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "qcSet")]
struct QcSetDocument {
    id: String,
    name: String,
    ladder: LadderDocument,
    #[serde(rename = "flag")]
    flags: Vec<FlagDocument>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LadderDocument {
    raw: FlagCode,
    good: FlagCode,
    #[serde(rename = "probablyGood")]
    probably_good: FlagCode,
    #[serde(rename = "probablyBad")]
    probably_bad: FlagCode,
    bad: FlagCode,
}

#[derive(Debug, Serialize, Deserialize)]
struct FlagDocument {
    code: FlagCode,
    name: String,
    #[serde(rename = "severityRank")]
    severity_rank: u32,
    color: String,
}

fn parse_color(text: &str) -> QcResult<Rgba> {
    let hex = text.trim().trim_start_matches('#');
    let channel = |i: usize| {
        hex.get(i..i + 2)
            .and_then(|h| u8::from_str_radix(h, 16).ok())
            .ok_or_else(|| QcError::Xml(format!("invalid colour {:?}", text)))
    };
    match hex.len() {
        6 => Ok(Rgba::new(channel(0)?, channel(2)?, channel(4)?)),
        8 => Ok(Rgba { r: channel(0)?, g: channel(2)?, b: channel(4)?, a: channel(6)? }),
        _ => Err(QcError::Xml(format!("invalid colour {:?}", text))),
    }
}

/// Parse a QC set definition; the result is validated like any other set
pub fn flag_set_from_xml(xml: &str) -> QcResult<FlagSet> {
    let doc: QcSetDocument = from_str(xml)?;
    let flags = doc
        .flags
        .into_iter()
        .map(|f| {
            Ok(FlagDefinition {
                code: f.code,
                name: f.name,
                severity_rank: f.severity_rank,
                color: parse_color(&f.color)?,
            })
        })
        .collect::<QcResult<Vec<_>>>()?;
    let ladder = LadderCodes {
        raw: doc.ladder.raw,
        good: doc.ladder.good,
        probably_good: doc.ladder.probably_good,
        probably_bad: doc.ladder.probably_bad,
        bad: doc.ladder.bad,
    };
    FlagSet::new(doc.id, doc.name, flags, ladder)
}

pub fn flag_set_to_xml(set: &FlagSet) -> QcResult<String> {
    let ladder = set.ladder();
    let doc = QcSetDocument {
        id: set.id().to_string(),
        name: set.name().to_string(),
        ladder: LadderDocument {
            raw: ladder.raw,
            good: ladder.good,
            probably_good: ladder.probably_good,
            probably_bad: ladder.probably_bad,
            bad: ladder.bad,
        },
        flags: set
            .flags()
            .iter()
            .map(|f| FlagDocument {
                code: f.code,
                name: f.name.clone(),
                severity_rank: f.severity_rank,
                color: f.color.to_string(),
            })
            .collect(),
    };
    Ok(to_string(&doc)?)
}

/// Load a QC set definition file
pub fn read_flag_set<P: AsRef<Path>>(path: P) -> QcResult<FlagSet> {
    log::info!("Reading QC set definition: {}", path.as_ref().display());
    let content = std::fs::read_to_string(&path)?;
    flag_set_from_xml(&content)
}

pub fn write_flag_set<P: AsRef<Path>>(set: &FlagSet, path: P) -> QcResult<()> {
    log::info!("Writing QC set {} to {}", set.id(), path.as_ref().display());
    std::fs::write(path, flag_set_to_xml(set)?)?;
    Ok(())
}
