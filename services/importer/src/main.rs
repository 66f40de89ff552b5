//! Importer Service - Bulk-loads tax qualification records (Calificación Tributaria)
//!
//! Responsibilities:
//! - Decode uploaded CSV/XLSX files (unknown encoding, unknown delimiter)
//! - Resolve noisy header names to logical fields
//! - Normalize locale-variant numbers and dates
//! - Compute monetary fields and the 30 allocation factors (F08..F37)
//! - Validate the credit-factor ceiling and persist row by row
//!
//! Each row is saved inside its own transaction: a bad row is reported
//! and skipped, sibling rows are unaffected. File-level problems
//! (unreadable container, missing instrument column) abort the whole
//! batch with a single report entry and zero saves.

use anyhow::{bail, Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use chrono::NaiveDate;
use clap::{Parser, ValueEnum};
use rust_decimal::{Decimal, RoundingStrategy};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Parser, Debug)]
#[command(name = "importer", about = "Bulk-imports tax qualification records from CSV/XLSX")]
struct Args {
    /// Path to the uploaded file (.csv, or any spreadsheet calamine can open)
    #[arg(long)]
    file: PathBuf,

    /// Owning user id (ownership is never taken from the file)
    #[arg(long)]
    user_id: i64,

    /// Fiscal year used when the file has no EJERCICIO column
    #[arg(long, default_value = "2025")]
    default_year: i32,

    /// How to read a lone dot in a numeric token ("25.190")
    #[arg(long, value_enum, default_value = "decimal")]
    single_dot: SingleDotPolicy,

    /// Which factor range counts toward the credit-sum ceiling
    #[arg(long, value_enum, default_value = "f08-f19")]
    credit_range: CreditRange,

    /// Whether factor cells hold fractions or currency amounts
    #[arg(long, value_enum, default_value = "fraction")]
    factor_mode: FactorMode,

    /// Tolerance added to the 1.0 credit-sum ceiling
    #[arg(long, default_value = "0.00000001")]
    tolerance: Decimal,

    /// Report a ceiling violation as a warning instead of rejecting the row
    #[arg(long, default_value = "false")]
    credit_sum_warn_only: bool,

    /// Leave the payment date unset on a bad token instead of failing the row
    #[arg(long, default_value = "false")]
    permissive_dates: bool,

    /// Dry run - decode, resolve and validate but don't save to database
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

// =============================================================================
// POLICY - the knobs the source system left ambiguous
// =============================================================================
// The upstream implementations disagreed on three points: whether a lone dot
// is a decimal point or a thousands separator, whether the credit ceiling
// covers F08-F19 or F08-F16, and whether factor cells are fractions or
// currency amounts. All three are explicit flags with documented defaults.

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SingleDotPolicy {
    /// "25.190" is 25.19
    Decimal,
    /// "25.190" is 25190 when exactly three digits follow the dot
    Thousands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CreditRange {
    #[value(name = "f08-f19")]
    F08ToF19,
    #[value(name = "f08-f16")]
    F08ToF16,
}

impl CreditRange {
    /// Inclusive factor-code bounds of the credit subset.
    fn codes(self) -> (u8, u8) {
        match self {
            CreditRange::F08ToF19 => (8, 19),
            CreditRange::F08ToF16 => (8, 16),
        }
    }

    fn label(self) -> &'static str {
        match self {
            CreditRange::F08ToF19 => "F08-F19",
            CreditRange::F08ToF16 => "F08-F16",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FactorMode {
    /// Factor cells already hold fractions of the total; stored as-is
    Fraction,
    /// Factor cells hold currency amounts; stored factor = amount / total
    Amount,
}

#[derive(Debug, Clone)]
struct ImportPolicy {
    single_dot: SingleDotPolicy,
    credit_range: CreditRange,
    factor_mode: FactorMode,
    tolerance: Decimal,
    credit_sum_warn_only: bool,
    strict_dates: bool,
    default_year: i32,
}

impl ImportPolicy {
    fn from_args(args: &Args) -> Self {
        ImportPolicy {
            single_dot: args.single_dot,
            credit_range: args.credit_range,
            factor_mode: args.factor_mode,
            tolerance: args.tolerance,
            credit_sum_warn_only: args.credit_sum_warn_only,
            strict_dates: !args.permissive_dates,
            default_year: args.default_year,
        }
    }
}

// =============================================================================
// FACTOR SET - F08..F37, fixed array indexed by code
// =============================================================================

/// First regulatory factor code.
const FACTOR_CODE_MIN: u8 = 8;
/// Last regulatory factor code.
const FACTOR_CODE_MAX: u8 = 37;
/// Number of allocation factors on a record.
const FACTOR_COUNT: usize = (FACTOR_CODE_MAX - FACTOR_CODE_MIN + 1) as usize;

/// All factor codes in persistence order.
fn factor_codes() -> impl Iterator<Item = u8> {
    FACTOR_CODE_MIN..=FACTOR_CODE_MAX
}

/// Array slot for a factor code.
fn factor_slot(code: u8) -> usize {
    (code - FACTOR_CODE_MIN) as usize
}

// =============================================================================
// ROW ERROR TAXONOMY
// =============================================================================

#[derive(Debug, Error)]
enum RowError {
    #[error("instrument '{0}' does not exist in the reference table")]
    UnknownInstrument(String),

    #[error("invalid payment date '{0}' (expected DD-MM-YYYY or YYYY-MM-DD)")]
    InvalidDate(String),

    #[error("invalid numeric value '{0}' for fiscal year")]
    Parse(String),

    #[error("credit factors {range} sum to {sum}, maximum allowed is 1.0")]
    FactorSumExceeded { range: &'static str, sum: Decimal },
}

/// One reported row failure. Row numbers are 1-based spreadsheet rows,
/// header = row 1, so data row i (0-based) reports as i + 2.
#[derive(Debug)]
struct RowFailure {
    row: usize,
    instrument_code: Option<String>,
    message: String,
}

impl RowFailure {
    fn new(row: usize, instrument_code: Option<String>, error: &RowError) -> Self {
        RowFailure {
            row,
            instrument_code,
            message: error.to_string(),
        }
    }
}

impl fmt::Display for RowFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.instrument_code {
            Some(code) => write!(f, "Row {} ({}): {}", self.row, code, self.message),
            None => write!(f, "Row {}: {}", self.row, self.message),
        }
    }
}

/// Outcome of a bulk import, returned to the caller once per invocation.
#[derive(Debug, Default)]
struct BatchReport {
    saved: usize,
    skipped: usize,
    failures: Vec<RowFailure>,
    warnings: Vec<String>,
}

// =============================================================================
// LOCALE NUMBER NORMALIZER
// =============================================================================
// Chilean broker files mix "1.234,56", "1234,56", "1234.56" and "1.234.567"
// in the same column. Every money/factor cell goes through this before any
// arithmetic; native float parsing is never applied to locale text.

/// Turn a free-text numeric token into an exact decimal.
///
/// Rules, in priority order:
/// 1. empty / whitespace / "nan" -> zero
/// 2. comma present -> dots are thousands separators, comma is the decimal point
/// 3. more than one dot -> all dots are thousands separators
/// 4. exactly one dot -> policy decides (decimal point, or thousands when a
///    group of exactly three digits follows)
fn normalize_decimal(raw: &str, policy: SingleDotPolicy) -> Result<Decimal, rust_decimal::Error> {
    let token = raw.trim();
    if token.is_empty() || token.eq_ignore_ascii_case("nan") {
        return Ok(Decimal::ZERO);
    }

    let dot_count = token.matches('.').count();
    let cleaned = if token.contains(',') {
        token.replace('.', "").replace(',', ".")
    } else if dot_count > 1 {
        token.replace('.', "")
    } else if dot_count == 1 {
        match policy {
            SingleDotPolicy::Decimal => token.to_string(),
            SingleDotPolicy::Thousands => match token.split_once('.') {
                Some((_, after)) if after.len() == 3 && after.chars().all(|c| c.is_ascii_digit()) => {
                    token.replace('.', "")
                }
                _ => token.to_string(),
            },
        }
    } else {
        token.to_string()
    };

    cleaned.parse::<Decimal>()
}

/// Money/factor cells substitute zero on a parse failure rather than
/// aborting the row.
fn decimal_or_zero(raw: &str, policy: SingleDotPolicy) -> Decimal {
    normalize_decimal(raw, policy).unwrap_or(Decimal::ZERO)
}

// =============================================================================
// DATE NORMALIZER
// =============================================================================

/// Parse a payment-date token as DD-MM-YYYY, then as YYYY-MM-DD.
/// Slashes are accepted as separators.
fn parse_payment_date(raw: &str) -> Option<NaiveDate> {
    let token = raw.trim().replace('/', "-");
    NaiveDate::parse_from_str(&token, "%d-%m-%Y")
        .or_else(|_| NaiveDate::parse_from_str(&token, "%Y-%m-%d"))
        .ok()
}

// =============================================================================
// ENCODING + DELIMITER PROBES
// =============================================================================

/// Decode raw bytes: UTF-8 with BOM, then UTF-8, then Latin-1.
/// Latin-1 (as its WINDOWS-1252 superset) cannot fail, so the probe always
/// yields text; a corrupt container surfaces later as a structural error.
fn decode_text(bytes: &[u8]) -> (String, &'static str) {
    if let Some(rest) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return (String::from_utf8_lossy(rest).into_owned(), "utf-8-bom");
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => (text.to_string(), "utf-8"),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            (decoded.into_owned(), "latin-1")
        }
    }
}

/// Guess the CSV delimiter from the first ~2048 characters.
fn sniff_delimiter(text: &str) -> u8 {
    let sample: String = text.chars().take(2048).collect();
    let candidates = [b';', b',', b'\t'];
    let mut best = b',';
    let mut best_count = 0;
    for candidate in candidates {
        let count = sample.bytes().filter(|b| *b == candidate).count();
        if count > best_count {
            best = candidate;
            best_count = count;
        }
    }
    best
}

// =============================================================================
// DATASET - uniform view over CSV and spreadsheet input
// =============================================================================

/// Header row plus data rows, all cells as trimmed strings.
#[derive(Debug)]
struct Dataset {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

fn read_csv_dataset(text: &str) -> Result<Dataset> {
    let delimiter = sniff_delimiter(text);
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .context("Failed to read CSV headers")?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result.context("Corrupt CSV record")?;
        rows.push(record.iter().map(|c| c.to_string()).collect());
    }

    Ok(Dataset { headers, rows })
}

/// Render a spreadsheet cell the way its text would look in a CSV export.
fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => {
            // Whole floats ("2024.0") print as integers so year and code
            // cells survive the spreadsheet round-trip
            if f.fract() == 0.0 && f.abs() < 1e15 {
                format!("{}", *f as i64)
            } else {
                format!("{}", f)
            }
        }
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|d| d.date().format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
        other => format!("{}", other),
    }
}

fn read_sheet_dataset(path: &Path) -> Result<Dataset> {
    let mut workbook: calamine::Sheets<_> =
        open_workbook_auto(path).context("Failed to open spreadsheet file")?;

    let sheet_names = workbook.sheet_names().to_vec();
    if sheet_names.is_empty() {
        bail!("Spreadsheet has no sheets");
    }
    let sheet_name = &sheet_names[0];

    let range = workbook
        .worksheet_range(sheet_name)
        .context("Failed to read sheet")?;

    let mut row_iter = range.rows();
    let headers: Vec<String> = row_iter
        .next()
        .context("Sheet has no header row")?
        .iter()
        .map(cell_to_string)
        .collect();

    let rows: Vec<Vec<String>> = row_iter
        .map(|row| row.iter().map(cell_to_string).collect())
        .collect();

    Ok(Dataset { headers, rows })
}

fn read_dataset(path: &Path) -> Result<Dataset> {
    let is_csv = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("csv"))
        .unwrap_or(false);

    if is_csv {
        let bytes = std::fs::read(path).context("Failed to read file")?;
        let (text, encoding) = decode_text(&bytes);
        println!("Decoded {} bytes as {}", bytes.len(), encoding);
        read_csv_dataset(&text)
    } else {
        read_sheet_dataset(path)
    }
}

// =============================================================================
// COLUMN RESOLVER
// =============================================================================
// Headers in broker files are noisy: "Instrumento", "NEMO ", "Código
// Instrumento", BOM artifacts. Each logical field carries an ordered keyword
// list; the first keyword that appears in any header wins, headers scanned
// in original column order within a keyword.

const INSTRUMENT_KEYWORDS: &[&str] = &["INSTRUMENTO", "NEMO", "CODIGO"];
const YEAR_KEYWORDS: &[&str] = &["EJERCICIO", "AÑO", "ANIO"];
const DATE_KEYWORDS: &[&str] = &["FECHA"];
const HISTORICAL_KEYWORDS: &[&str] = &["HISTORICO", "HISTÓRICO"];
const UPDATE_FACTOR_KEYWORDS: &[&str] = &["ACTUALIZACION", "ACTUALIZACIÓN"];
const TOTAL_KEYWORDS: &[&str] = &["MONTO TOTAL", "TOTAL", "MONTO"];

/// Strip BOM artifacts, trim and upper-case a header for matching.
fn normalize_header(header: &str) -> String {
    header.trim_matches('\u{feff}').trim().to_uppercase()
}

/// First header containing any keyword, keywords scanned in priority order.
fn find_column(headers: &[String], keywords: &[&str]) -> Option<usize> {
    for keyword in keywords {
        for (idx, header) in headers.iter().enumerate() {
            if header.contains(keyword) {
                return Some(idx);
            }
        }
    }
    None
}

/// Concrete column for each logical field of the upload.
#[derive(Debug)]
struct ColumnMap {
    instrument: usize,
    fiscal_year: Option<usize>,
    payment_date: Option<usize>,
    historical: Option<usize>,
    update_factor: Option<usize>,
    total: Option<usize>,
    factors: [Option<usize>; FACTOR_COUNT],
}

fn resolve_columns(raw_headers: &[String]) -> Result<ColumnMap> {
    let headers: Vec<String> = raw_headers.iter().map(|h| normalize_header(h)).collect();

    let instrument = find_column(&headers, INSTRUMENT_KEYWORDS).context(
        "Missing instrument column. Expected a header containing one of: INSTRUMENTO, NEMO, CODIGO",
    )?;

    let mut factors = [None; FACTOR_COUNT];
    for code in factor_codes() {
        let keyword = format!("F{:02}", code);
        factors[factor_slot(code)] = headers.iter().position(|h| h.contains(&keyword));
    }

    Ok(ColumnMap {
        instrument,
        fiscal_year: find_column(&headers, YEAR_KEYWORDS),
        payment_date: find_column(&headers, DATE_KEYWORDS),
        historical: find_column(&headers, HISTORICAL_KEYWORDS),
        update_factor: find_column(&headers, UPDATE_FACTOR_KEYWORDS),
        total: find_column(&headers, TOTAL_KEYWORDS),
        factors,
    })
}

// =============================================================================
// ROW INGESTION ENGINE
// =============================================================================

/// A fully computed record, validated and ready to persist.
#[derive(Debug)]
struct PreparedRecord {
    row: usize,
    instrument_id: i64,
    instrument_code: String,
    fiscal_year: i32,
    payment_date: Option<NaiveDate>,
    historical: Decimal,
    update_factor: Decimal,
    total: Decimal,
    factors: [Decimal; FACTOR_COUNT],
    credit_sum: Decimal,
}

enum RowPlan {
    /// Blank or "nan" instrument cell: deliberate no-op, not a failure
    Skip,
    Record(PreparedRecord),
}

fn cell<'a>(cells: &'a [String], idx: Option<usize>) -> &'a str {
    idx.and_then(|i| cells.get(i)).map(|s| s.trim()).unwrap_or("")
}

/// Take one data row through instrument resolution, field assignment and
/// factor computation. The credit-sum ceiling is checked by the caller so
/// the warn-only policy can keep the record.
fn prepare_row(
    row_number: usize,
    cells: &[String],
    map: &ColumnMap,
    instruments: &HashMap<String, i64>,
    policy: &ImportPolicy,
) -> Result<RowPlan, RowFailure> {
    let raw_code = cell(cells, Some(map.instrument));
    if raw_code.is_empty() || raw_code.eq_ignore_ascii_case("nan") {
        return Ok(RowPlan::Skip);
    }

    let instrument_code = raw_code.to_string();
    let instrument_id = *instruments.get(&instrument_code.to_uppercase()).ok_or_else(|| {
        RowFailure::new(
            row_number,
            Some(instrument_code.clone()),
            &RowError::UnknownInstrument(instrument_code.clone()),
        )
    })?;

    let fail = |error: &RowError| RowFailure::new(row_number, Some(instrument_code.clone()), error);

    let year_cell = cell(cells, map.fiscal_year);
    let fiscal_year = if year_cell.is_empty() || year_cell.eq_ignore_ascii_case("nan") {
        policy.default_year
    } else {
        year_cell
            .parse::<i32>()
            .map_err(|_| fail(&RowError::Parse(year_cell.to_string())))?
    };

    let date_cell = cell(cells, map.payment_date);
    let payment_date = if date_cell.is_empty() || date_cell.eq_ignore_ascii_case("nan") {
        None
    } else {
        match parse_payment_date(date_cell) {
            Some(date) => Some(date),
            None if policy.strict_dates => {
                return Err(fail(&RowError::InvalidDate(date_cell.to_string())));
            }
            None => None,
        }
    };

    let historical = decimal_or_zero(cell(cells, map.historical), policy.single_dot);
    let update_cell = cell(cells, map.update_factor);
    let update_factor = if update_cell.is_empty() || update_cell.eq_ignore_ascii_case("nan") {
        Decimal::ONE
    } else {
        decimal_or_zero(update_cell, policy.single_dot)
    };

    // total is always recomputed server-side, never trusted from the file
    // when the historical amount is available
    let total = if historical > Decimal::ZERO {
        historical * update_factor
    } else {
        decimal_or_zero(cell(cells, map.total), policy.single_dot)
    };

    let mut factors = [Decimal::ZERO; FACTOR_COUNT];
    for code in factor_codes() {
        let slot = factor_slot(code);
        factors[slot] = decimal_or_zero(cell(cells, map.factors[slot]), policy.single_dot);
    }

    if policy.factor_mode == FactorMode::Amount {
        if total.is_zero() {
            factors = [Decimal::ZERO; FACTOR_COUNT];
        } else {
            for factor in &mut factors {
                *factor = (*factor / total)
                    .round_dp_with_strategy(8, RoundingStrategy::MidpointAwayFromZero);
            }
        }
    }

    let (lo, hi) = policy.credit_range.codes();
    let credit_sum: Decimal = (lo..=hi).map(|code| factors[factor_slot(code)]).sum();

    Ok(RowPlan::Record(PreparedRecord {
        row: row_number,
        instrument_id,
        instrument_code,
        fiscal_year,
        payment_date,
        historical,
        update_factor,
        total,
        factors,
        credit_sum,
    }))
}

/// Run every data row through the engine. Returns the records that passed
/// validation plus the ordered failures, warnings and silent-skip count.
fn plan_rows(
    dataset: &Dataset,
    map: &ColumnMap,
    instruments: &HashMap<String, i64>,
    policy: &ImportPolicy,
) -> (Vec<PreparedRecord>, Vec<RowFailure>, Vec<String>, usize) {
    let ceiling = Decimal::ONE + policy.tolerance;
    let mut prepared = Vec::new();
    let mut failures = Vec::new();
    let mut warnings = Vec::new();
    let mut skipped = 0;

    for (idx, cells) in dataset.rows.iter().enumerate() {
        let row_number = idx + 2; // header is row 1

        match prepare_row(row_number, cells, map, instruments, policy) {
            Ok(RowPlan::Skip) => skipped += 1,
            Ok(RowPlan::Record(record)) => {
                if record.credit_sum > ceiling {
                    let error = RowError::FactorSumExceeded {
                        range: policy.credit_range.label(),
                        sum: record.credit_sum,
                    };
                    if policy.credit_sum_warn_only {
                        warnings.push(
                            RowFailure::new(
                                row_number,
                                Some(record.instrument_code.clone()),
                                &error,
                            )
                            .to_string(),
                        );
                        prepared.push(record);
                    } else {
                        failures.push(RowFailure::new(
                            row_number,
                            Some(record.instrument_code.clone()),
                            &error,
                        ));
                    }
                } else {
                    prepared.push(record);
                }
            }
            Err(failure) => failures.push(failure),
        }
    }

    (prepared, failures, warnings, skipped)
}

// =============================================================================
// PERSISTENCE
// =============================================================================

const ORIGIN_BULK_UPLOAD: &str = "Carga Masiva";

/// Preload the instrument reference table keyed by upper-cased code, so the
/// per-row lookup is an exact case-insensitive match.
async fn load_instruments(pool: &PgPool) -> Result<HashMap<String, i64>> {
    let rows: Vec<(i64, String)> = sqlx::query_as("SELECT instrumento_id, codigo FROM instrumentos")
        .fetch_all(pool)
        .await
        .context("Failed to load instrument reference table")?;

    Ok(rows
        .into_iter()
        .map(|(id, code)| (code.trim().to_uppercase(), id))
        .collect())
}

/// INSERT statement covering the fixed columns plus factor_08..factor_37.
fn insert_statement() -> String {
    let mut columns: Vec<String> = [
        "usuario_id",
        "instrumento_id",
        "ejercicio",
        "secuencia_evento",
        "fecha_pago",
        "valor_historico",
        "factor_actualizacion",
        "monto_total",
        "origen",
        "usuario_crea",
    ]
    .iter()
    .map(|c| c.to_string())
    .collect();

    for code in factor_codes() {
        columns.push(format!("factor_{:02}", code));
    }

    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${}", i)).collect();
    format!(
        "INSERT INTO calificaciones ({}) VALUES ({}) RETURNING calificacion_id",
        columns.join(", "),
        placeholders.join(", ")
    )
}

/// Save one record inside its own transaction. Any failure rolls back this
/// row only; sibling rows are unaffected.
async fn save_record(pool: &PgPool, record: &PreparedRecord, user_id: i64) -> Result<i64> {
    let mut tx = pool.begin().await?;

    let sql = insert_statement();
    let mut query = sqlx::query_scalar::<_, i64>(&sql)
        .bind(user_id)
        .bind(record.instrument_id)
        .bind(record.fiscal_year)
        .bind(0_i64)
        .bind(record.payment_date)
        .bind(record.historical)
        .bind(record.update_factor)
        .bind(record.total)
        .bind(ORIGIN_BULK_UPLOAD)
        .bind(user_id);
    for factor in &record.factors {
        query = query.bind(*factor);
    }

    let id = query.fetch_one(&mut *tx).await?;
    tx.commit().await?;
    Ok(id)
}

// =============================================================================
// MAIN
// =============================================================================

fn print_report(report: &BatchReport) {
    println!("\n=== Batch Report ===");
    println!("Saved:   {}", report.saved);
    println!("Skipped: {}", report.skipped);
    println!("Errors:  {}", report.failures.len());

    for failure in report.failures.iter().take(5) {
        println!("  {}", failure);
    }
    if report.failures.len() > 5 {
        println!("  ... and {} more", report.failures.len() - 5);
    }

    for warning in &report.warnings {
        println!("  warning: {}", warning);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let policy = ImportPolicy::from_args(&args);

    println!("=== Calificación Tributaria Importer ===");
    println!("File: {}", args.file.display());
    println!("User: {}", args.user_id);
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });
    println!(
        "Policy: single-dot={:?} credit-range={} factor-mode={:?} tolerance={}",
        policy.single_dot,
        policy.credit_range.label(),
        policy.factor_mode,
        policy.tolerance
    );

    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await
        .context("Failed to connect to database")?;

    // Batch-fatal problems (unreadable file, missing instrument column)
    // short-circuit to a single-entry report with zero saves
    let result = async {
        let dataset = read_dataset(&args.file)?;
        println!(
            "Dataset: {} data rows x {} columns",
            dataset.rows.len(),
            dataset.headers.len()
        );
        for (i, header) in dataset.headers.iter().enumerate() {
            if !header.is_empty() {
                println!("  [{:2}] {}", i, header);
            }
        }

        let map = resolve_columns(&dataset.headers)?;
        println!("\nColumn mapping:");
        println!("  Instrument:    {}", map.instrument);
        println!("  Fiscal year:   {:?}", map.fiscal_year);
        println!("  Payment date:  {:?}", map.payment_date);
        println!("  Historical:    {:?}", map.historical);
        println!("  Update factor: {:?}", map.update_factor);
        println!("  Total:         {:?}", map.total);
        let mapped_factors = map.factors.iter().filter(|f| f.is_some()).count();
        println!("  Factors:       {} of {} mapped", mapped_factors, FACTOR_COUNT);

        let instruments = load_instruments(&pool).await?;
        println!("Loaded {} instruments", instruments.len());

        let (prepared, mut failures, warnings, skipped) =
            plan_rows(&dataset, &map, &instruments, &policy);

        if args.dry_run {
            println!("\nDry run - nothing saved");
            return Ok(BatchReport {
                saved: prepared.len(),
                skipped,
                failures,
                warnings,
            });
        }

        let mut saved = 0;
        for record in &prepared {
            match save_record(&pool, record, args.user_id).await {
                Ok(_) => saved += 1,
                Err(e) => failures.push(RowFailure {
                    row: record.row,
                    instrument_code: Some(record.instrument_code.clone()),
                    message: format!("database error: {}", e),
                }),
            }
        }
        failures.sort_by_key(|f| f.row);

        Ok::<BatchReport, anyhow::Error>(BatchReport {
            saved,
            skipped,
            failures,
            warnings,
        })
    }
    .await;

    let report = match result {
        Ok(report) => report,
        Err(e) => BatchReport {
            saved: 0,
            skipped: 0,
            failures: vec![RowFailure {
                row: 1,
                instrument_code: None,
                message: format!("file error: {:#}", e),
            }],
            warnings: Vec::new(),
        },
    };

    print_report(&report);
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn test_policy() -> ImportPolicy {
        ImportPolicy {
            single_dot: SingleDotPolicy::Decimal,
            credit_range: CreditRange::F08ToF19,
            factor_mode: FactorMode::Fraction,
            tolerance: dec("0.00000001"),
            credit_sum_warn_only: false,
            strict_dates: true,
            default_year: 2025,
        }
    }

    fn test_instruments() -> HashMap<String, i64> {
        let mut map = HashMap::new();
        map.insert("AAPL".to_string(), 1);
        map.insert("FALABELLA".to_string(), 2);
        map.insert("COPEC".to_string(), 3);
        map
    }

    // -------------------------------------------------------------------------
    // LOCALE NUMBER NORMALIZER
    // -------------------------------------------------------------------------

    #[test]
    fn test_normalize_thousands_dot_decimal_comma() {
        let v = normalize_decimal("1.234,56", SingleDotPolicy::Decimal).unwrap();
        assert_eq!(v, dec("1234.56"));
    }

    #[test]
    fn test_normalize_comma_only() {
        let v = normalize_decimal("1234,56", SingleDotPolicy::Decimal).unwrap();
        assert_eq!(v, dec("1234.56"));
    }

    #[test]
    fn test_normalize_equivalent_spellings() {
        let a = normalize_decimal("1.234,56", SingleDotPolicy::Decimal).unwrap();
        let b = normalize_decimal("1234,56", SingleDotPolicy::Decimal).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_normalize_empty_and_whitespace() {
        assert_eq!(normalize_decimal("", SingleDotPolicy::Decimal).unwrap(), Decimal::ZERO);
        assert_eq!(normalize_decimal("   ", SingleDotPolicy::Decimal).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn test_normalize_nan_token() {
        assert_eq!(normalize_decimal("nan", SingleDotPolicy::Decimal).unwrap(), Decimal::ZERO);
        assert_eq!(normalize_decimal("NaN", SingleDotPolicy::Decimal).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn test_normalize_multiple_dots_are_thousands() {
        let v = normalize_decimal("1.234.567", SingleDotPolicy::Decimal).unwrap();
        assert_eq!(v, dec("1234567"));
    }

    #[test]
    fn test_normalize_single_dot_decimal_policy() {
        let v = normalize_decimal("25.190", SingleDotPolicy::Decimal).unwrap();
        assert_eq!(v, dec("25.190"));
    }

    #[test]
    fn test_normalize_single_dot_thousands_policy() {
        let v = normalize_decimal("25.190", SingleDotPolicy::Thousands).unwrap();
        assert_eq!(v, dec("25190"));
    }

    #[test]
    fn test_normalize_single_dot_thousands_policy_needs_group_of_three() {
        // "3.14" is not a thousands group even under the thousands policy
        let v = normalize_decimal("3.14", SingleDotPolicy::Thousands).unwrap();
        assert_eq!(v, dec("3.14"));
    }

    #[test]
    fn test_normalize_negative() {
        let v = normalize_decimal("-0,5", SingleDotPolicy::Decimal).unwrap();
        assert_eq!(v, dec("-0.5"));
    }

    #[test]
    fn test_normalize_garbage_fails() {
        assert!(normalize_decimal("12a34", SingleDotPolicy::Decimal).is_err());
        assert!(normalize_decimal("N/A", SingleDotPolicy::Decimal).is_err());
    }

    #[test]
    fn test_decimal_or_zero_substitutes_on_garbage() {
        assert_eq!(decimal_or_zero("12a34", SingleDotPolicy::Decimal), Decimal::ZERO);
        assert_eq!(decimal_or_zero("0,9", SingleDotPolicy::Decimal), dec("0.9"));
    }

    // -------------------------------------------------------------------------
    // DATE NORMALIZER
    // -------------------------------------------------------------------------

    #[test]
    fn test_date_day_month_year() {
        let d = parse_payment_date("09-12-2025").unwrap();
        assert_eq!(d, NaiveDate::from_ymd_opt(2025, 12, 9).unwrap());
    }

    #[test]
    fn test_date_iso() {
        let d = parse_payment_date("2025-12-09").unwrap();
        assert_eq!(d, NaiveDate::from_ymd_opt(2025, 12, 9).unwrap());
    }

    #[test]
    fn test_date_slash_separators() {
        let d = parse_payment_date("09/12/2025").unwrap();
        assert_eq!(d, NaiveDate::from_ymd_opt(2025, 12, 9).unwrap());
    }

    #[test]
    fn test_date_invalid_month_fails() {
        assert!(parse_payment_date("13-13-2025").is_none());
    }

    #[test]
    fn test_date_garbage_fails() {
        assert!(parse_payment_date("pronto").is_none());
    }

    // -------------------------------------------------------------------------
    // ENCODING + DELIMITER PROBES
    // -------------------------------------------------------------------------

    #[test]
    fn test_decode_utf8_bom() {
        let bytes = b"\xEF\xBB\xBFNEMO,F08\n";
        let (text, encoding) = decode_text(bytes);
        assert_eq!(encoding, "utf-8-bom");
        assert!(text.starts_with("NEMO"));
    }

    #[test]
    fn test_decode_plain_utf8() {
        let (text, encoding) = decode_text("AÑO,MONTO\n".as_bytes());
        assert_eq!(encoding, "utf-8");
        assert!(text.starts_with("AÑO"));
    }

    #[test]
    fn test_decode_latin1_fallback() {
        // "AÑO" in Latin-1: 0xD1 is not valid UTF-8
        let bytes = b"A\xD1O,MONTO\n";
        let (text, encoding) = decode_text(bytes);
        assert_eq!(encoding, "latin-1");
        assert!(text.starts_with("AÑO"));
    }

    #[test]
    fn test_sniff_semicolon() {
        assert_eq!(sniff_delimiter("A;B;C\n1;2;3\n"), b';');
    }

    #[test]
    fn test_sniff_comma_default() {
        assert_eq!(sniff_delimiter("A,B,C\n"), b',');
        assert_eq!(sniff_delimiter("SINGLE\n"), b',');
    }

    #[test]
    fn test_sniff_tab() {
        assert_eq!(sniff_delimiter("A\tB\tC\n1\t2\t3\n"), b'\t');
    }

    // -------------------------------------------------------------------------
    // COLUMN RESOLVER
    // -------------------------------------------------------------------------

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_resolver_instrument_by_nemo() {
        let map = resolve_columns(&headers(&["FECHA", "NEMO", "MONTO"])).unwrap();
        assert_eq!(map.instrument, 1);
    }

    #[test]
    fn test_resolver_keyword_priority_over_column_order() {
        // CODIGO appears first by column, but INSTRUMENTO outranks it
        let map = resolve_columns(&headers(&["CODIGO INTERNO", "INSTRUMENTO"])).unwrap();
        assert_eq!(map.instrument, 1);
    }

    #[test]
    fn test_resolver_case_and_whitespace_noise() {
        let map = resolve_columns(&headers(&["  nemo ", "Monto Total"])).unwrap();
        assert_eq!(map.instrument, 0);
        assert_eq!(map.total, Some(1));
    }

    #[test]
    fn test_resolver_bom_artifact_on_first_header() {
        let map = resolve_columns(&headers(&["\u{feff}INSTRUMENTO", "F08"])).unwrap();
        assert_eq!(map.instrument, 0);
        assert_eq!(map.factors[0], Some(1));
    }

    #[test]
    fn test_resolver_missing_instrument_is_fatal() {
        let result = resolve_columns(&headers(&["FECHA", "MONTO", "F08"]));
        assert!(result.is_err());
    }

    #[test]
    fn test_resolver_factor_columns() {
        let map = resolve_columns(&headers(&["NEMO", "F08", "F19", "F37"])).unwrap();
        assert_eq!(map.factors[factor_slot(8)], Some(1));
        assert_eq!(map.factors[factor_slot(19)], Some(2));
        assert_eq!(map.factors[factor_slot(37)], Some(3));
        assert_eq!(map.factors[factor_slot(20)], None);
    }

    #[test]
    fn test_resolver_optional_fields() {
        let map =
            resolve_columns(&headers(&["NEMO", "EJERCICIO", "FECHA PAGO", "VALOR HISTORICO"]))
                .unwrap();
        assert_eq!(map.fiscal_year, Some(1));
        assert_eq!(map.payment_date, Some(2));
        assert_eq!(map.historical, Some(3));
        assert_eq!(map.total, None);
    }

    // -------------------------------------------------------------------------
    // ROW INGESTION ENGINE
    // -------------------------------------------------------------------------

    fn dataset_from_csv(text: &str) -> Dataset {
        read_csv_dataset(text).unwrap()
    }

    fn plan(
        text: &str,
        policy: &ImportPolicy,
    ) -> (Vec<PreparedRecord>, Vec<RowFailure>, Vec<String>, usize) {
        let dataset = dataset_from_csv(text);
        let map = resolve_columns(&dataset.headers).unwrap();
        plan_rows(&dataset, &map, &test_instruments(), policy)
    }

    #[test]
    fn test_total_is_historical_times_update_factor() {
        let csv = "NEMO,VALOR HISTORICO,FACTOR ACTUALIZACION\nAAPL,1000,\"1,05\"\n";
        let (prepared, failures, _, _) = plan(csv, &test_policy());
        assert!(failures.is_empty());
        assert_eq!(prepared[0].historical, dec("1000"));
        assert_eq!(prepared[0].update_factor, dec("1.05"));
        assert_eq!(prepared[0].total, dec("1050.00"));
    }

    #[test]
    fn test_total_falls_back_to_total_column() {
        let csv = "NEMO,MONTO TOTAL\nAAPL,\"2.500,75\"\n";
        let (prepared, _, _, _) = plan(csv, &test_policy());
        assert_eq!(prepared[0].total, dec("2500.75"));
        assert_eq!(prepared[0].historical, Decimal::ZERO);
    }

    #[test]
    fn test_update_factor_defaults_to_one() {
        let csv = "NEMO,VALOR HISTORICO\nAAPL,500\n";
        let (prepared, _, _, _) = plan(csv, &test_policy());
        assert_eq!(prepared[0].update_factor, Decimal::ONE);
        assert_eq!(prepared[0].total, dec("500"));
    }

    #[test]
    fn test_skip_blank_and_nan_instrument_cells() {
        let csv = "NEMO,F08\n,0.5\nnan,0.5\n   ,0.5\nAAPL,0.5\n";
        let (prepared, failures, _, skipped) = plan(csv, &test_policy());
        assert_eq!(skipped, 3);
        assert_eq!(prepared.len(), 1);
        assert!(failures.is_empty());
        // saved + errors accounts for every non-skipped row
        assert_eq!(prepared.len() + failures.len(), 1);
    }

    #[test]
    fn test_unknown_instrument_reports_code() {
        let csv = "NEMO,F08\nZZZZ,0.1\n";
        let (prepared, failures, _, _) = plan(csv, &test_policy());
        assert!(prepared.is_empty());
        assert_eq!(failures.len(), 1);
        let rendered = failures[0].to_string();
        assert!(rendered.starts_with("Row 2 (ZZZZ):"), "got: {}", rendered);
        assert!(rendered.contains("does not exist"));
    }

    #[test]
    fn test_instrument_lookup_is_case_insensitive() {
        let csv = "NEMO\naapl\n";
        let (prepared, failures, _, _) = plan(csv, &test_policy());
        assert!(failures.is_empty());
        assert_eq!(prepared[0].instrument_id, 1);
        assert_eq!(prepared[0].instrument_code, "aapl");
    }

    #[test]
    fn test_credit_sum_within_ceiling_passes() {
        let csv = "NEMO,F08,F09\nAAPL,\"0,5\",\"0,4\"\n";
        let (prepared, failures, _, _) = plan(csv, &test_policy());
        assert!(failures.is_empty());
        assert_eq!(prepared[0].credit_sum, dec("0.9"));
    }

    #[test]
    fn test_credit_sum_exactly_one_passes() {
        let csv = "NEMO,F08,F09\nAAPL,\"0,6\",\"0,4\"\n";
        let (prepared, failures, _, _) = plan(csv, &test_policy());
        assert!(failures.is_empty());
        assert_eq!(prepared.len(), 1);
    }

    #[test]
    fn test_credit_sum_over_ceiling_rejects_row() {
        let csv = "NEMO,F08,F12\nAAPL,\"0,7\",\"0,5\"\n";
        let (prepared, failures, _, _) = plan(csv, &test_policy());
        assert!(prepared.is_empty());
        assert_eq!(failures.len(), 1);
        let rendered = failures[0].to_string();
        assert!(rendered.contains("sum to 1.2"), "got: {}", rendered);
        assert!(rendered.contains("F08-F19"));
    }

    #[test]
    fn test_credit_sum_ignores_non_credit_factors() {
        // F20 is outside the credit range, so 0.9 + 0.9 there is fine
        let csv = "NEMO,F08,F20\nAAPL,\"0,9\",\"0,9\"\n";
        let (prepared, failures, _, _) = plan(csv, &test_policy());
        assert!(failures.is_empty());
        assert_eq!(prepared[0].credit_sum, dec("0.9"));
        assert_eq!(prepared[0].factors[factor_slot(20)], dec("0.9"));
    }

    #[test]
    fn test_credit_range_f08_f16_variant() {
        let mut policy = test_policy();
        policy.credit_range = CreditRange::F08ToF16;
        // F17 would break F08-F19 but is outside F08-F16
        let csv = "NEMO,F08,F17\nAAPL,\"0,9\",\"0,9\"\n";
        let (prepared, failures, _, _) = plan(csv, &policy);
        assert!(failures.is_empty());
        assert_eq!(prepared[0].credit_sum, dec("0.9"));
    }

    #[test]
    fn test_credit_sum_warn_only_saves_and_warns() {
        let mut policy = test_policy();
        policy.credit_sum_warn_only = true;
        let csv = "NEMO,F08,F09\nAAPL,\"0,7\",\"0,5\"\n";
        let (prepared, failures, warnings, _) = plan(csv, &policy);
        assert_eq!(prepared.len(), 1);
        assert!(failures.is_empty());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("sum to 1.2"));
    }

    #[test]
    fn test_strict_date_failure_rejects_row() {
        let csv = "NEMO,FECHA PAGO\nAAPL,13-13-2025\n";
        let (prepared, failures, _, _) = plan(csv, &test_policy());
        assert!(prepared.is_empty());
        assert!(failures[0].to_string().contains("invalid payment date"));
    }

    #[test]
    fn test_permissive_date_failure_leaves_date_unset() {
        let mut policy = test_policy();
        policy.strict_dates = false;
        let csv = "NEMO,FECHA PAGO\nAAPL,13-13-2025\n";
        let (prepared, failures, _, _) = plan(csv, &policy);
        assert!(failures.is_empty());
        assert_eq!(prepared[0].payment_date, None);
    }

    #[test]
    fn test_blank_date_is_not_an_error() {
        let csv = "NEMO,FECHA PAGO\nAAPL,\n";
        let (prepared, failures, _, _) = plan(csv, &test_policy());
        assert!(failures.is_empty());
        assert_eq!(prepared[0].payment_date, None);
    }

    #[test]
    fn test_fiscal_year_from_column_and_default() {
        let csv = "NEMO,EJERCICIO\nAAPL,2024\nFALABELLA,\n";
        let (prepared, _, _, _) = plan(csv, &test_policy());
        assert_eq!(prepared[0].fiscal_year, 2024);
        assert_eq!(prepared[1].fiscal_year, 2025);
    }

    #[test]
    fn test_fiscal_year_garbage_is_a_row_error() {
        let csv = "NEMO,EJERCICIO\nAAPL,veinte\n";
        let (prepared, failures, _, _) = plan(csv, &test_policy());
        assert!(prepared.is_empty());
        assert!(failures[0].to_string().contains("fiscal year"));
    }

    #[test]
    fn test_garbage_factor_cell_becomes_zero() {
        let csv = "NEMO,F08,F09\nAAPL,sin dato,\"0,4\"\n";
        let (prepared, failures, _, _) = plan(csv, &test_policy());
        assert!(failures.is_empty());
        assert_eq!(prepared[0].factors[factor_slot(8)], Decimal::ZERO);
        assert_eq!(prepared[0].factors[factor_slot(9)], dec("0.4"));
    }

    #[test]
    fn test_row_numbering_has_header_offset() {
        let csv = "NEMO\nAAPL\nZZZZ\nCOPEC\n";
        let (prepared, failures, _, _) = plan(csv, &test_policy());
        assert_eq!(prepared[0].row, 2);
        assert_eq!(failures[0].row, 3);
        assert_eq!(prepared[1].row, 4);
    }

    // -------------------------------------------------------------------------
    // FACTOR DERIVATION - amount mode
    // -------------------------------------------------------------------------

    #[test]
    fn test_amount_mode_derives_fractions() {
        let mut policy = test_policy();
        policy.factor_mode = FactorMode::Amount;
        let csv = "NEMO,VALOR HISTORICO,F08,F09\nAAPL,1000,250,750\n";
        let (prepared, failures, _, _) = plan(csv, &policy);
        assert!(failures.is_empty());
        assert_eq!(prepared[0].factors[factor_slot(8)], dec("0.25"));
        assert_eq!(prepared[0].factors[factor_slot(9)], dec("0.75"));
        assert_eq!(prepared[0].credit_sum, dec("1.00"));
    }

    #[test]
    fn test_amount_mode_zero_total_yields_zero_factors() {
        let mut policy = test_policy();
        policy.factor_mode = FactorMode::Amount;
        let csv = "NEMO,F08,F09\nAAPL,250,750\n";
        let (prepared, failures, _, _) = plan(csv, &policy);
        assert!(failures.is_empty());
        assert!(prepared[0].factors.iter().all(|f| f.is_zero()));
    }

    #[test]
    fn test_amount_mode_rounds_half_up_to_eight_places() {
        let mut policy = test_policy();
        policy.factor_mode = FactorMode::Amount;
        let csv = "NEMO,VALOR HISTORICO,F08\nAAPL,3,1\n";
        let (prepared, _, _, _) = plan(csv, &policy);
        assert_eq!(prepared[0].factors[factor_slot(8)], dec("0.33333333"));
    }

    // -------------------------------------------------------------------------
    // END-TO-END SCENARIO
    // -------------------------------------------------------------------------

    #[test]
    fn test_three_row_upload_scenario() {
        let csv = "INSTRUMENTO,VALOR HISTORICO,FACTOR ACTUALIZACION,F08,F09,F12\n\
                   AAPL,1000,\"1,05\",\"0,5\",\"0,4\",0\n\
                   ZZZZ,100,1,0,0,0\n\
                   FALABELLA,100,1,\"0,7\",0,\"0,5\"\n";

        let (prepared, failures, warnings, skipped) = plan(csv, &test_policy());

        assert_eq!(prepared.len(), 1);
        assert_eq!(failures.len(), 2);
        assert_eq!(warnings.len(), 0);
        assert_eq!(skipped, 0);

        assert_eq!(prepared[0].instrument_code, "AAPL");
        assert_eq!(prepared[0].total, dec("1050.00"));

        assert!(failures[0].to_string().starts_with("Row 3 (ZZZZ):"));
        assert!(failures[1].to_string().starts_with("Row 4 (FALABELLA):"));
        assert!(failures[1].to_string().contains("sum to 1.2"));
    }

    #[test]
    fn test_semicolon_latin1_upload() {
        // Same pipeline, Chilean export flavor: semicolon delimiter,
        // Latin-1 bytes, comma decimals
        let bytes = b"NEMO;VALOR HIST\xD3RICO;F08\nCOPEC;1.234,50;0,3\n";
        let (text, encoding) = decode_text(bytes);
        assert_eq!(encoding, "latin-1");

        let dataset = read_csv_dataset(&text).unwrap();
        let map = resolve_columns(&dataset.headers).unwrap();
        let (prepared, failures, _, _) =
            plan_rows(&dataset, &map, &test_instruments(), &test_policy());

        assert!(failures.is_empty());
        assert_eq!(prepared[0].historical, dec("1234.50"));
        assert_eq!(prepared[0].factors[factor_slot(8)], dec("0.3"));
    }

    // -------------------------------------------------------------------------
    // PERSISTENCE STATEMENT SHAPE
    // -------------------------------------------------------------------------

    #[test]
    fn test_insert_statement_covers_all_factors() {
        let sql = insert_statement();
        assert!(sql.contains("factor_08"));
        assert!(sql.contains("factor_37"));
        assert!(sql.contains("$40")); // 10 fixed columns + 30 factors
        assert!(!sql.contains("$41"));
        assert!(sql.contains("RETURNING calificacion_id"));
    }

    #[test]
    fn test_factor_code_table() {
        assert_eq!(factor_codes().count(), FACTOR_COUNT);
        assert_eq!(factor_slot(8), 0);
        assert_eq!(factor_slot(37), 29);
    }
}
