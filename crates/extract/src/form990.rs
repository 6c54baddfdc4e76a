//! Deterministic Form 990 parser.
//!
//! Anchored line regexes over text-extracted PDF pages. The plausibility
//! bounds table is the sole trust boundary on numeric fields: a value that
//! parses but falls outside its bounds is dropped, so a future grammar- or
//! LLM-based replacement can swap in without changing downstream contracts.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// (min, max) in dollars. Values outside are treated as parse errors.
fn financial_bounds(field: &str) -> Option<(f64, f64)> {
    match field {
        "total_revenue" | "total_expenses" => Some((100.0, 50_000_000_000.0)),
        "program_expenses" | "management_expenses" | "fundraising_expenses"
        | "contributions_gifts" | "program_service_revenue" => Some((0.0, 50_000_000_000.0)),
        "investment_income" => Some((-10_000_000_000.0, 50_000_000_000.0)),
        "net_assets" => Some((-10_000_000_000.0, 100_000_000_000.0)),
        "total_assets" | "total_liabilities" => Some((0.0, 100_000_000_000.0)),
        _ => None,
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Form990Data {
    pub organization_name: Option<String>,
    pub ein: Option<String>,
    pub website: Option<String>,
    pub fiscal_year: Option<i32>,
    pub mission_statement: Option<String>,
    pub number_of_employees: Option<u32>,
    pub number_of_volunteers: Option<u32>,
    pub total_revenue: Option<f64>,
    pub total_expenses: Option<f64>,
    pub net_assets: Option<f64>,
    pub contributions_gifts: Option<f64>,
    pub program_service_revenue: Option<f64>,
    pub investment_income: Option<f64>,
    pub program_expenses: Option<f64>,
    pub management_expenses: Option<f64>,
    pub fundraising_expenses: Option<f64>,
    pub total_assets: Option<f64>,
    pub total_liabilities: Option<f64>,
    pub program_expense_ratio: Option<f64>,
    pub overhead_ratio: Option<f64>,
    pub fundraising_efficiency: Option<f64>,
}

impl Form990Data {
    pub fn calculate_ratios(&mut self) {
        if let (Some(total), Some(program)) = (self.total_expenses, self.program_expenses) {
            if total > 0.0 {
                self.program_expense_ratio = Some(round1(program / total * 100.0));
            }
        }
        if let Some(total) = self.total_expenses {
            if total > 0.0 {
                let overhead =
                    self.management_expenses.unwrap_or(0.0) + self.fundraising_expenses.unwrap_or(0.0);
                if overhead > 0.0 {
                    self.overhead_ratio = Some(round1(overhead / total * 100.0));
                }
            }
        }
        if let (Some(fundraising), Some(contributions)) =
            (self.fundraising_expenses, self.contributions_gifts)
        {
            if fundraising > 0.0 {
                self.fundraising_efficiency = Some((contributions / fundraising * 100.0).round() / 100.0);
            }
        }
    }

    /// Enough signal to be worth attaching to the profile.
    pub fn is_usable(&self) -> bool {
        self.total_revenue.is_some() || self.total_expenses.is_some() || self.mission_statement.is_some()
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

static EIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Employer identification number\s*\n?\s*([0-9]{2}\s*-?\s*[0-9]{7})").expect("ein")
});

static NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^(?:C\s+)?Name of organization\s*\n?\s*(.+)$").expect("name")
});

static WEBSITE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Website:?\s*[►>]?\s*((?:https?://|www\.)\S+)").expect("website"));

static FISCAL_YEAR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:calendar year|tax year beginning).{0,40}?(20[0-9]{2})").expect("fiscal year")
});

static MISSION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?is)Briefly describe the organization[''`]s mission(?: or most significant activities)?[:.]?\s*(.{20,600}?)(?:\n\s*2\s|Check this box|$)",
    )
    .expect("mission")
});

static EMPLOYEES_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Total number of individuals employed[^\n0-9]*([\d,]+)").expect("employees")
});

static VOLUNTEERS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Total number of volunteers[^\n0-9]*([\d,]+)").expect("volunteers")
});

/// (field, anchor pattern) pairs for Part I / VIII / IX / X money lines. The
/// capture is the last number on the anchored line.
static MONEY_LINES: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    fn line(anchor: &str) -> Regex {
        Regex::new(&format!(
            r"(?im)^[^\n]*{anchor}[^\n0-9\-]*(\(?-?[\d,]{{3,16}}\)?)\s*\.?\s*$"
        ))
        .expect("money line")
    }
    vec![
        ("total_revenue", line(r"Total revenue")),
        ("total_expenses", line(r"Total expenses")),
        ("contributions_gifts", line(r"Contributions and grants")),
        ("program_service_revenue", line(r"Program service revenue")),
        ("investment_income", line(r"Investment income")),
        ("program_expenses", line(r"(?:Total program service expenses|Program services? expenses)")),
        ("management_expenses", line(r"Management and general")),
        ("fundraising_expenses", line(r"(?:Total fundraising expenses|Fundraising expenses)")),
        ("total_assets", line(r"Total assets")),
        ("total_liabilities", line(r"Total liabilities")),
        ("net_assets", line(r"Net assets or fund balances at end of year")),
    ]
});

pub struct Form990Parser;

impl Form990Parser {
    /// Parse text extracted from a Form 990 PDF. Returns None when nothing
    /// useful could be pulled out.
    pub fn parse_text(text: &str) -> Option<Form990Data> {
        let mut data = Form990Data::default();

        if let Some(caps) = EIN_RE.captures(text) {
            let digits: String = caps[1].chars().filter(|c| c.is_ascii_digit()).collect();
            if digits.len() == 9 {
                data.ein = Some(format!("{}-{}", &digits[..2], &digits[2..]));
            }
        }
        if let Some(caps) = NAME_RE.captures(text) {
            let name = caps[1].trim().to_string();
            if name.len() > 2 {
                data.organization_name = Some(name);
            }
        }
        if let Some(caps) = WEBSITE_RE.captures(text) {
            data.website = Some(caps[1].trim_end_matches(['.', ',']).to_string());
        }
        if let Some(caps) = FISCAL_YEAR_RE.captures(text) {
            data.fiscal_year = caps[1].parse().ok();
        }
        if let Some(caps) = MISSION_RE.captures(text) {
            let mission = caps[1].split_whitespace().collect::<Vec<_>>().join(" ");
            data.mission_statement = Some(mission);
        }
        if let Some(caps) = EMPLOYEES_RE.captures(text) {
            data.number_of_employees = parse_count(&caps[1]);
        }
        if let Some(caps) = VOLUNTEERS_RE.captures(text) {
            data.number_of_volunteers = parse_count(&caps[1]);
        }

        for (field, re) in MONEY_LINES.iter() {
            // The same anchor appears on several pages (summary + detail);
            // the first hit is the Part I summary value.
            if let Some(caps) = re.captures(text) {
                if let Some(value) = validate_financial(field, parse_money(&caps[1])) {
                    set_money_field(&mut data, field, value);
                }
            }
        }

        data.calculate_ratios();
        if data.is_usable() || data.ein.is_some() {
            Some(data)
        } else {
            None
        }
    }

    /// Extract text from PDF bytes and parse it.
    pub fn parse_pdf_bytes(bytes: &[u8]) -> Option<Form990Data> {
        Self::parse_text(&extract_pdf_text(bytes)?)
    }
}

/// Plain-text extraction from PDF bytes; shared by the deterministic parser
/// and the LLM fallback path.
pub fn extract_pdf_text(bytes: &[u8]) -> Option<String> {
    match pdf_extract::extract_text_from_mem(bytes) {
        Ok(text) => Some(text),
        Err(e) => {
            debug!("PDF text extraction failed: {e}");
            None
        }
    }
}

fn parse_money(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    let negative = trimmed.starts_with('(') && trimmed.ends_with(')');
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() || digits.len() > 13 {
        return None;
    }
    let value: f64 = digits.parse().ok()?;
    Some(if negative { -value } else { value })
}

fn parse_count(raw: &str) -> Option<u32> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let value: u64 = digits.parse().ok()?;
    if value <= 10_000_000 {
        Some(value as u32)
    } else {
        None
    }
}

fn validate_financial(field: &str, value: Option<f64>) -> Option<f64> {
    let value = value?;
    if let Some((min, max)) = financial_bounds(field) {
        if value < min || value > max {
            warn!(field, value, "value outside plausibility bounds; dropping");
            return None;
        }
    }
    Some(value)
}

fn set_money_field(data: &mut Form990Data, field: &str, value: f64) {
    match field {
        "total_revenue" => data.total_revenue = Some(value),
        "total_expenses" => data.total_expenses = Some(value),
        "contributions_gifts" => data.contributions_gifts = Some(value),
        "program_service_revenue" => data.program_service_revenue = Some(value),
        "investment_income" => data.investment_income = Some(value),
        "program_expenses" => data.program_expenses = Some(value),
        "management_expenses" => data.management_expenses = Some(value),
        "fundraising_expenses" => data.fundraising_expenses = Some(value),
        "total_assets" => data.total_assets = Some(value),
        "total_liabilities" => data.total_liabilities = Some(value),
        "net_assets" => data.net_assets = Some(value),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Form 990 Return of Organization Exempt From Income Tax
For the 2023 calendar year, or tax year beginning 2023
C Name of organization
EXAMPLE RELIEF FOUNDATION
D Employer identification number
95-4453134
Website: www.example-relief.org
1 Briefly describe the organization's mission or most significant activities:
To provide emergency relief and long-term development programs to families in need.
2 Check this box
5 Total number of individuals employed 142
6 Total number of volunteers 1,250
8 Contributions and grants 12,450,000
9 Program service revenue 310,000
10 Investment income 85,000
12 Total revenue 12,845,000
18 Total expenses 11,900,000
22 Net assets or fund balances at end of year 4,200,000
25 Total fundraising expenses 600,000
Total program service expenses 10,100,000
Management and general 1,200,000
Total assets 6,900,000
Total liabilities 2,700,000
";

    #[test]
    fn parses_header_and_financials() {
        let data = Form990Parser::parse_text(SAMPLE).unwrap();
        assert_eq!(data.ein.as_deref(), Some("95-4453134"));
        assert_eq!(data.organization_name.as_deref(), Some("EXAMPLE RELIEF FOUNDATION"));
        assert_eq!(data.fiscal_year, Some(2023));
        assert_eq!(data.total_revenue, Some(12_845_000.0));
        assert_eq!(data.total_expenses, Some(11_900_000.0));
        assert_eq!(data.program_expenses, Some(10_100_000.0));
        assert_eq!(data.net_assets, Some(4_200_000.0));
        assert_eq!(data.number_of_employees, Some(142));
        assert_eq!(data.number_of_volunteers, Some(1250));
        assert!(data.mission_statement.unwrap().starts_with("To provide emergency relief"));
    }

    #[test]
    fn ratios_are_derived() {
        let data = Form990Parser::parse_text(SAMPLE).unwrap();
        assert_eq!(data.program_expense_ratio, Some(84.9));
        // (1.2M + 0.6M) / 11.9M = 15.1%
        assert_eq!(data.overhead_ratio, Some(15.1));
    }

    #[test]
    fn implausible_values_are_dropped() {
        let text = "\
D Employer identification number
12-3456789
12 Total revenue 75,000,000,000,000
";
        let data = Form990Parser::parse_text(text).unwrap();
        // $75 trillion fails the bounds check; the EIN keeps the parse alive.
        assert_eq!(data.total_revenue, None);
        assert_eq!(data.ein.as_deref(), Some("12-3456789"));
    }

    #[test]
    fn parenthesized_numbers_are_negative() {
        assert_eq!(parse_money("(1,234,567)"), Some(-1_234_567.0));
        assert_eq!(parse_money("4,200"), Some(4_200.0));
        assert_eq!(parse_money("—"), None);
    }

    #[test]
    fn garbage_text_is_rejected() {
        assert!(Form990Parser::parse_text("lorem ipsum dolor sit amet").is_none());
    }
}
