//! The closed set of remote catalogs and their period arithmetic.
//!
//! A catalog partitions the remote hierarchy by publication frequency and region
//! scope. Period codes on the wire depend on the frequency:
//!
//! | periodicity | wire code | stored period |
//! |---|---|---|
//! | annual    | `2023`    | `202312` |
//! | quarterly | `2023B`   | `202306` |
//! | monthly   | `202304`  | `202304` |
//!
//! Stored periods are always `yyyyMM` integers so they sort across catalogs.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CatalogError;

pub const MIN_YEAR: i32 = 1900;
pub const MAX_YEAR: i32 = 2100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Catalog {
    Hgnd,
    Hgjd,
    Hgyd,
    Fsnd,
    Fsjd,
    Fsyd,
    Csnd,
    Csyd,
    Gatnd,
    Gatyd,
    Gjnd,
    Gjyd,
    Gjydsdj,
    Gjydsc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Periodicity {
    Annual,
    Quarterly,
    Monthly,
}

impl Catalog {
    pub const ALL: [Catalog; 14] = [
        Catalog::Hgnd,
        Catalog::Hgjd,
        Catalog::Hgyd,
        Catalog::Fsnd,
        Catalog::Fsjd,
        Catalog::Fsyd,
        Catalog::Csnd,
        Catalog::Csyd,
        Catalog::Gatnd,
        Catalog::Gatyd,
        Catalog::Gjnd,
        Catalog::Gjyd,
        Catalog::Gjydsdj,
        Catalog::Gjydsc,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            Catalog::Hgnd => "hgnd",
            Catalog::Hgjd => "hgjd",
            Catalog::Hgyd => "hgyd",
            Catalog::Fsnd => "fsnd",
            Catalog::Fsjd => "fsjd",
            Catalog::Fsyd => "fsyd",
            Catalog::Csnd => "csnd",
            Catalog::Csyd => "csyd",
            Catalog::Gatnd => "gatnd",
            Catalog::Gatyd => "gatyd",
            Catalog::Gjnd => "gjnd",
            Catalog::Gjyd => "gjyd",
            Catalog::Gjydsdj => "gjydsdj",
            Catalog::Gjydsc => "gjydsc",
        }
    }

    pub fn periodicity(&self) -> Periodicity {
        match self {
            Catalog::Gjydsdj | Catalog::Gjydsc => Periodicity::Monthly,
            other => {
                let code = other.code();
                if code.ends_with("nd") {
                    Periodicity::Annual
                } else if code.ends_with("jd") {
                    Periodicity::Quarterly
                } else {
                    Periodicity::Monthly
                }
            }
        }
    }

    /// Catalogs broken down by region. Only these carry a region tree.
    pub fn is_regional(&self) -> bool {
        !matches!(self, Catalog::Hgnd | Catalog::Hgjd | Catalog::Hgyd)
    }

    pub fn regional() -> impl Iterator<Item = Catalog> {
        Catalog::ALL.into_iter().filter(Catalog::is_regional)
    }

    /// Converts a wire period code into a `yyyyMM` number.
    pub fn period_number(&self, code: &str) -> Result<u32, CatalogError> {
        let malformed = || CatalogError::MalformedPeriod {
            catalog: *self,
            value: code.to_string(),
        };
        let caps = period_pattern(self.periodicity())
            .captures(code)
            .ok_or_else(malformed)?;
        let year: u32 = caps[1].parse().map_err(|_| malformed())?;
        let month = match self.periodicity() {
            Periodicity::Annual => 12,
            Periodicity::Quarterly => match &caps[2] {
                "A" => 3,
                "B" => 6,
                "C" => 9,
                _ => 12,
            },
            Periodicity::Monthly => caps[2].parse().map_err(|_| malformed())?,
        };
        Ok(year * 100 + month)
    }

    /// Converts a `yyyyMM` number back into the wire period code.
    pub fn period_code(&self, number: u32) -> Result<String, CatalogError> {
        let year = number / 100;
        let month = number % 100;
        let code = match (self.periodicity(), month) {
            (Periodicity::Annual, 12) => format!("{year:04}"),
            (Periodicity::Quarterly, 3) => format!("{year:04}A"),
            (Periodicity::Quarterly, 6) => format!("{year:04}B"),
            (Periodicity::Quarterly, 9) => format!("{year:04}C"),
            (Periodicity::Quarterly, 12) => format!("{year:04}D"),
            (Periodicity::Monthly, 1..=12) => format!("{year:04}{month:02}"),
            _ => {
                return Err(CatalogError::MalformedPeriod {
                    catalog: *self,
                    value: number.to_string(),
                })
            }
        };
        Ok(code)
    }

    /// Every period of this catalog's frequency within the inclusive year range.
    pub fn periods_for_years(&self, from: i32, to: i32) -> Result<Vec<u32>, CatalogError> {
        validate_year_range(from, to)?;
        let months: &[u32] = match self.periodicity() {
            Periodicity::Annual => &[12],
            Periodicity::Quarterly => &[3, 6, 9, 12],
            Periodicity::Monthly => &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12],
        };
        Ok((from..=to)
            .flat_map(|year| months.iter().map(move |m| year as u32 * 100 + m))
            .collect())
    }
}

pub fn validate_year_range(from: i32, to: i32) -> Result<(), CatalogError> {
    if from > to || from < MIN_YEAR || to > MAX_YEAR {
        return Err(CatalogError::YearRange { from, to });
    }
    Ok(())
}

fn period_pattern(periodicity: Periodicity) -> &'static Regex {
    static ANNUAL: OnceLock<Regex> = OnceLock::new();
    static QUARTERLY: OnceLock<Regex> = OnceLock::new();
    static MONTHLY: OnceLock<Regex> = OnceLock::new();
    match periodicity {
        Periodicity::Annual => {
            ANNUAL.get_or_init(|| Regex::new(r"^(\d{4})$").expect("annual period pattern"))
        }
        Periodicity::Quarterly => QUARTERLY
            .get_or_init(|| Regex::new(r"^(\d{4})([A-D])$").expect("quarterly period pattern")),
        Periodicity::Monthly => MONTHLY.get_or_init(|| {
            Regex::new(r"^(\d{4})(0[1-9]|1[0-2])$").expect("monthly period pattern")
        }),
    }
}

impl fmt::Display for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Catalog {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Catalog::ALL
            .into_iter()
            .find(|c| c.code() == wanted)
            .ok_or_else(|| CatalogError::UnknownCatalog(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn periodicity_follows_code_suffix() {
        assert_eq!(Catalog::Hgnd.periodicity(), Periodicity::Annual);
        assert_eq!(Catalog::Fsjd.periodicity(), Periodicity::Quarterly);
        assert_eq!(Catalog::Csyd.periodicity(), Periodicity::Monthly);
        assert_eq!(Catalog::Gjydsdj.periodicity(), Periodicity::Monthly);
        assert_eq!(Catalog::Gjydsc.periodicity(), Periodicity::Monthly);
    }

    #[test]
    fn macro_catalogs_are_not_regional() {
        let regional: Vec<_> = Catalog::regional().collect();
        assert_eq!(regional.len(), 11);
        assert!(!regional.contains(&Catalog::Hgyd));
        assert!(regional.contains(&Catalog::Fsyd));
    }

    #[test]
    fn parses_codes_case_insensitively() {
        assert_eq!("GATND".parse::<Catalog>(), Ok(Catalog::Gatnd));
        assert_eq!(
            "nope".parse::<Catalog>(),
            Err(CatalogError::UnknownCatalog("nope".into()))
        );
    }

    #[test]
    fn quarterly_codes_map_to_quarter_end_months() {
        assert_eq!(Catalog::Hgjd.period_number("2023B"), Ok(202306));
        assert_eq!(Catalog::Hgjd.period_code(202312).as_deref(), Ok("2023D"));
        assert!(Catalog::Hgjd.period_number("2023E").is_err());
        assert!(Catalog::Hgjd.period_code(202305).is_err());
    }

    #[test]
    fn annual_and_monthly_codes() {
        assert_eq!(Catalog::Hgnd.period_number("2021"), Ok(202112));
        assert_eq!(Catalog::Hgyd.period_number("202113"), Err(CatalogError::MalformedPeriod {
            catalog: Catalog::Hgyd,
            value: "202113".into(),
        }));
        assert_eq!(Catalog::Hgyd.period_code(202102).as_deref(), Ok("202102"));
    }

    #[test]
    fn periods_cover_the_year_range() {
        assert_eq!(
            Catalog::Fsnd.periods_for_years(2020, 2022),
            Ok(vec![202012, 202112, 202212])
        );
        assert_eq!(Catalog::Fsjd.periods_for_years(2020, 2020).map(|p| p.len()), Ok(4));
        assert_eq!(Catalog::Fsyd.periods_for_years(2019, 2020).map(|p| p.len()), Ok(24));
        assert_eq!(
            Catalog::Fsnd.periods_for_years(2023, 2020),
            Err(CatalogError::YearRange { from: 2023, to: 2020 })
        );
    }
}
