use crate::error::{EvalError, Result};
use std::fmt;

/// Ground-truth class produced by the rule-based phenotype classifier.
/// The derived order follows the integer codes, which is the order used for
/// majority tie-breaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PhenotypeClass {
    Case,
    Control,
    Unknown,
}

impl PhenotypeClass {
    pub const ALL: [PhenotypeClass; 3] = [
        PhenotypeClass::Case,
        PhenotypeClass::Control,
        PhenotypeClass::Unknown,
    ];

    pub fn code(self) -> i64 {
        match self {
            PhenotypeClass::Case => 1,
            PhenotypeClass::Control => 2,
            PhenotypeClass::Unknown => 3,
        }
    }

    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            1 => Ok(PhenotypeClass::Case),
            2 => Ok(PhenotypeClass::Control),
            3 => Ok(PhenotypeClass::Unknown),
            other => Err(EvalError::UnknownPhenotypeCode(other)),
        }
    }
}

impl fmt::Display for PhenotypeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PhenotypeClass::Case => "case",
            PhenotypeClass::Control => "control",
            PhenotypeClass::Unknown => "unknown",
        };
        f.write_str(name)
    }
}
