//! API Service - Maintenance surface for tax qualification records
//!
//! Endpoints:
//! - GET /health - Health check
//! - GET /esquema - Certificate schema registry (sections, factors, labels)
//! - GET /instrumentos - Instrument reference listing
//! - GET /calificaciones - Ownership-filtered record listing
//! - POST /calificaciones - Manual create (total recomputed server-side)
//! - PUT /calificaciones/:id - Edit in place under the ownership constraint
//! - DELETE /calificaciones/:id - Delete under the ownership constraint
//!
//! Authentication is an external collaborator: the caller arrives with an
//! X-Usuario-Id header already vouched for upstream; this service resolves
//! it against the usuarios table for the privilege flag.

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

// ============================================================================
// State
// ============================================================================

#[derive(Clone)]
struct AppState {
    pool: PgPool,
}

// ============================================================================
// Certificate Schema Registry
// ============================================================================
// Static catalogue of the 30 regulatory allocation factors (F08..F37),
// grouped into thematic sections for the form renderer. Immutable at
// runtime; the importer only needs the flat 08..37 code range.

const FACTOR_CODE_MIN: u8 = 8;
const FACTOR_CODE_MAX: u8 = 37;
const FACTOR_COUNT: usize = (FACTOR_CODE_MAX - FACTOR_CODE_MIN + 1) as usize;

struct FactorDef {
    code: u8,
    label: &'static str,
    help: &'static str,
}

struct SectionDef {
    name: &'static str,
    color: &'static str,
    factors: &'static [FactorDef],
}

static CREDIT_FACTORS: &[FactorDef] = &[
    FactorDef {
        code: 8,
        label: "Crédito por impuesto de primera categoría con derecho a devolución",
        help: "Fracción del reparto con crédito IDPC recuperable",
    },
    FactorDef {
        code: 9,
        label: "Crédito por impuesto de primera categoría sin derecho a devolución",
        help: "Fracción con crédito IDPC no recuperable",
    },
    FactorDef {
        code: 10,
        label: "Crédito por impuesto tasa adicional ex art. 21",
        help: "",
    },
    FactorDef {
        code: 11,
        label: "Crédito por impuestos pagados en el exterior",
        help: "Rentas con tributación externa acreditable",
    },
    FactorDef {
        code: 12,
        label: "Crédito por impuesto de primera categoría voluntario",
        help: "",
    },
    FactorDef {
        code: 13,
        label: "Crédito por rentas de zonas francas y otras franquicias",
        help: "",
    },
    FactorDef {
        code: 14,
        label: "Crédito por donaciones",
        help: "Donaciones con beneficio tributario asociadas al reparto",
    },
    FactorDef {
        code: 15,
        label: "Crédito por impuesto adicional art. 58",
        help: "",
    },
    FactorDef {
        code: 16,
        label: "Crédito por ahorro neto positivo",
        help: "",
    },
    FactorDef {
        code: 17,
        label: "Crédito por impuesto único de segunda categoría",
        help: "",
    },
    FactorDef {
        code: 18,
        label: "Crédito por gastos rechazados",
        help: "",
    },
    FactorDef {
        code: 19,
        label: "Crédito por devoluciones de capital",
        help: "",
    },
];

static EXEMPT_FACTORS: &[FactorDef] = &[
    FactorDef {
        code: 20,
        label: "Rentas exentas de impuesto global complementario",
        help: "",
    },
    FactorDef {
        code: 21,
        label: "Rentas exentas de impuesto adicional",
        help: "",
    },
    FactorDef {
        code: 22,
        label: "Ingresos no constitutivos de renta",
        help: "Fracción del reparto que no tributa",
    },
    FactorDef {
        code: 23,
        label: "Rentas con tributación cumplida",
        help: "",
    },
    FactorDef {
        code: 24,
        label: "Devoluciones de capital art. 17 N°7",
        help: "",
    },
    FactorDef {
        code: 25,
        label: "Utilidades afectas generadas hasta 1983",
        help: "",
    },
    FactorDef {
        code: 26,
        label: "Rentas del registro RAP",
        help: "",
    },
    FactorDef {
        code: 27,
        label: "Rentas exentas por convenios internacionales",
        help: "",
    },
    FactorDef {
        code: 28,
        label: "Ingresos percibidos por cuenta de terceros",
        help: "",
    },
];

static OTHER_FACTORS: &[FactorDef] = &[
    FactorDef {
        code: 29,
        label: "Rebaja por dividendos hipotecarios",
        help: "",
    },
    FactorDef {
        code: 30,
        label: "Rebaja por intereses art. 55 bis",
        help: "",
    },
    FactorDef {
        code: 31,
        label: "Enajenaciones acogidas al art. 107",
        help: "",
    },
    FactorDef {
        code: 32,
        label: "Mayor valor no constitutivo de renta",
        help: "",
    },
    FactorDef {
        code: 33,
        label: "Retenciones de impuesto adicional",
        help: "",
    },
    FactorDef {
        code: 34,
        label: "Impuesto voluntario pagado por la sociedad",
        help: "",
    },
    FactorDef {
        code: 35,
        label: "Gastos rechazados afectos al art. 21",
        help: "",
    },
    FactorDef {
        code: 36,
        label: "Otros conceptos informados al SII",
        help: "",
    },
    FactorDef {
        code: 37,
        label: "Montos no clasificados",
        help: "Residual para montos sin categoría declarada",
    },
];

static CERTIFICATE_SCHEMA: &[SectionDef] = &[
    SectionDef {
        name: "Créditos por impuestos",
        color: "#1f6f43",
        factors: CREDIT_FACTORS,
    },
    SectionDef {
        name: "Rentas exentas e ingresos no renta",
        color: "#2b5d8a",
        factors: EXEMPT_FACTORS,
    },
    SectionDef {
        name: "Rebajas y otros conceptos",
        color: "#8a6d2b",
        factors: OTHER_FACTORS,
    },
];

fn factor_codes() -> impl Iterator<Item = u8> {
    FACTOR_CODE_MIN..=FACTOR_CODE_MAX
}

fn factor_slot(code: u8) -> usize {
    (code - FACTOR_CODE_MIN) as usize
}

/// External-facing factor key, e.g. "f08".
fn factor_key(code: u8) -> String {
    format!("f{:02}", code)
}

/// Parse an external factor key back to its code.
fn parse_factor_code(key: &str) -> Option<u8> {
    let rest = key.strip_prefix('f').or_else(|| key.strip_prefix('F'))?;
    let code: u8 = rest.parse().ok()?;
    (FACTOR_CODE_MIN..=FACTOR_CODE_MAX).contains(&code).then_some(code)
}

// ============================================================================
// Business rules shared with the importer
// ============================================================================

/// Credit-factor subset for the ceiling rule (F08-F19) and its tolerance.
const CREDIT_CODE_MIN: u8 = 8;
const CREDIT_CODE_MAX: u8 = 19;

fn credit_ceiling() -> Decimal {
    Decimal::ONE + Decimal::new(1, 8)
}

fn credit_sum(factors: &[Decimal; FACTOR_COUNT]) -> Decimal {
    (CREDIT_CODE_MIN..=CREDIT_CODE_MAX)
        .map(|code| factors[factor_slot(code)])
        .sum()
}

/// total = historical x update_factor, recomputed on every save; the
/// client-supplied total is only used when no historical amount exists.
fn compute_total(historical: Decimal, update_factor: Decimal, supplied: Option<Decimal>) -> Decimal {
    if historical > Decimal::ZERO {
        historical * update_factor
    } else {
        supplied.unwrap_or(Decimal::ZERO)
    }
}

/// Turn the request's {"f08": ...} map into the fixed factor array.
fn build_factor_array(
    input: &BTreeMap<String, Decimal>,
) -> Result<[Decimal; FACTOR_COUNT], String> {
    let mut factors = [Decimal::ZERO; FACTOR_COUNT];
    for (key, value) in input {
        let code = parse_factor_code(key)
            .ok_or_else(|| format!("unknown factor code '{}' (expected f08..f37)", key))?;
        factors[factor_slot(code)] = *value;
    }
    Ok(factors)
}

// ============================================================================
// Identity
// ============================================================================

struct CurrentUser {
    usuario_id: i64,
    es_privilegiado: bool,
}

async fn current_user(
    pool: &PgPool,
    headers: &HeaderMap,
) -> Result<CurrentUser, (StatusCode, Json<ErrorResponse>)> {
    let unauthorized = |msg: &str| {
        (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: msg.to_string(),
            }),
        )
    };

    let usuario_id: i64 = headers
        .get("x-usuario-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| unauthorized("Missing or invalid X-Usuario-Id header"))?;

    let row: Option<(i64, bool)> = sqlx::query_as(
        "SELECT usuario_id, es_privilegiado FROM usuarios WHERE usuario_id = $1 AND estado = 'Activo'",
    )
    .bind(usuario_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
    })?;

    match row {
        Some((usuario_id, es_privilegiado)) => Ok(CurrentUser {
            usuario_id,
            es_privilegiado,
        }),
        None => Err(unauthorized("Unknown or inactive user")),
    }
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct SchemaFactor {
    code: String,
    label: &'static str,
    help: &'static str,
}

#[derive(Serialize)]
struct SchemaSection {
    name: &'static str,
    color: &'static str,
    factors: Vec<SchemaFactor>,
}

#[derive(Serialize, sqlx::FromRow)]
struct InstrumentResponse {
    instrumento_id: i64,
    codigo: String,
    descripcion: Option<String>,
    tipo_instrumento: Option<String>,
}

#[derive(Serialize)]
struct QualificationResponse {
    calificacion_id: i64,
    usuario_id: i64,
    instrumento_id: i64,
    instrumento_codigo: String,
    ejercicio: i32,
    secuencia_evento: i64,
    fecha_pago: Option<NaiveDate>,
    valor_historico: Decimal,
    factor_actualizacion: Decimal,
    monto_total: Decimal,
    origen: String,
    fecha_creacion: DateTime<Utc>,
    factores: BTreeMap<String, Decimal>,
}

// ============================================================================
// Query params / request bodies
// ============================================================================

#[derive(Deserialize)]
struct InstrumentsQuery {
    query: Option<String>,
    limit: Option<i64>,
}

#[derive(Deserialize)]
struct QualificationsQuery {
    ejercicio: Option<i32>,
    limit: Option<i64>,
}

#[derive(Deserialize)]
struct QualificationInput {
    instrumento_id: i64,
    ejercicio: i32,
    secuencia_evento: Option<i64>,
    fecha_pago: Option<NaiveDate>,
    valor_historico: Option<Decimal>,
    factor_actualizacion: Option<Decimal>,
    monto_total: Option<Decimal>,
    #[serde(default)]
    factores: BTreeMap<String, Decimal>,
}

/// Server-side view of a submitted record after normalization/validation.
#[derive(Debug)]
struct ValidatedInput {
    instrumento_id: i64,
    ejercicio: i32,
    secuencia_evento: i64,
    fecha_pago: Option<NaiveDate>,
    valor_historico: Decimal,
    factor_actualizacion: Decimal,
    monto_total: Decimal,
    factors: [Decimal; FACTOR_COUNT],
}

fn validate_input(input: &QualificationInput) -> Result<ValidatedInput, String> {
    let factors = build_factor_array(&input.factores)?;

    let sum = credit_sum(&factors);
    if sum > credit_ceiling() {
        return Err(format!(
            "credit factors F08-F19 sum to {}, maximum allowed is 1.0",
            sum
        ));
    }

    let valor_historico = input.valor_historico.unwrap_or(Decimal::ZERO);
    let factor_actualizacion = input.factor_actualizacion.unwrap_or(Decimal::ONE);
    let monto_total = compute_total(valor_historico, factor_actualizacion, input.monto_total);

    Ok(ValidatedInput {
        instrumento_id: input.instrumento_id,
        ejercicio: input.ejercicio,
        secuencia_evento: input.secuencia_evento.unwrap_or(0),
        fecha_pago: input.fecha_pago,
        valor_historico,
        factor_actualizacion,
        monto_total,
        factors,
    })
}

// ============================================================================
// SQL statement builders (fixed columns + factor_08..factor_37)
// ============================================================================

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

fn update_statement() -> String {
    let mut sets: Vec<String> = [
        "instrumento_id = $1",
        "ejercicio = $2",
        "secuencia_evento = $3",
        "fecha_pago = $4",
        "valor_historico = $5",
        "factor_actualizacion = $6",
        "monto_total = $7",
        "usuario_modifica = $8",
        "fecha_modificacion = now()",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    let mut idx = 9;
    for code in factor_codes() {
        sets.push(format!("factor_{:02} = ${}", code, idx));
        idx += 1;
    }

    // Ownership constraint lives in the WHERE clause: non-owners simply
    // don't match, which the handler reports as not-found
    format!(
        "UPDATE calificaciones SET {} WHERE calificacion_id = ${} AND (usuario_id = ${} OR ${})",
        sets.join(", "),
        idx,
        idx + 1,
        idx + 2
    )
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: "0.1.0",
    })
}

async fn schema_handler() -> impl IntoResponse {
    let sections: Vec<SchemaSection> = CERTIFICATE_SCHEMA
        .iter()
        .map(|section| SchemaSection {
            name: section.name,
            color: section.color,
            factors: section
                .factors
                .iter()
                .map(|f| SchemaFactor {
                    code: factor_key(f.code),
                    label: f.label,
                    help: f.help,
                })
                .collect(),
        })
        .collect();

    Json(serde_json::json!({ "sections": sections }))
}

async fn instruments_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<InstrumentsQuery>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(100).min(1000);

    let instruments: Result<Vec<InstrumentResponse>, _> = if let Some(q) = params.query {
        let pattern = format!("%{}%", q.to_lowercase());
        sqlx::query_as(
            r#"
            SELECT instrumento_id, codigo, descripcion, tipo_instrumento
            FROM instrumentos
            WHERE LOWER(codigo) LIKE $1 OR LOWER(COALESCE(descripcion, '')) LIKE $1
            ORDER BY codigo
            LIMIT $2
            "#,
        )
        .bind(pattern)
        .bind(limit)
        .fetch_all(&state.pool)
        .await
    } else {
        sqlx::query_as(
            "SELECT instrumento_id, codigo, descripcion, tipo_instrumento FROM instrumentos ORDER BY codigo LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&state.pool)
        .await
    };

    match instruments {
        Ok(i) => Json(serde_json::json!({ "instrumentos": i })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

fn qualification_from_row(row: &sqlx::postgres::PgRow) -> Result<QualificationResponse, sqlx::Error> {
    use sqlx::Row;

    let mut factores = BTreeMap::new();
    for code in factor_codes() {
        let column = format!("factor_{:02}", code);
        let value: Decimal = row.try_get(column.as_str())?;
        factores.insert(factor_key(code), value);
    }

    Ok(QualificationResponse {
        calificacion_id: row.try_get("calificacion_id")?,
        usuario_id: row.try_get("usuario_id")?,
        instrumento_id: row.try_get("instrumento_id")?,
        instrumento_codigo: row.try_get("instrumento_codigo")?,
        ejercicio: row.try_get("ejercicio")?,
        secuencia_evento: row.try_get("secuencia_evento")?,
        fecha_pago: row.try_get("fecha_pago")?,
        valor_historico: row.try_get("valor_historico")?,
        factor_actualizacion: row.try_get("factor_actualizacion")?,
        monto_total: row.try_get("monto_total")?,
        origen: row.try_get("origen")?,
        fecha_creacion: row.try_get("fecha_creacion")?,
        factores,
    })
}

async fn list_qualifications_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<QualificationsQuery>,
) -> impl IntoResponse {
    let user = match current_user(&state.pool, &headers).await {
        Ok(u) => u,
        Err(r) => return r.into_response(),
    };

    let limit = params.limit.unwrap_or(100).min(1000);

    // R1: non-privileged callers only see their own records
    let mut query = String::from(
        r#"
        SELECT c.*, i.codigo AS instrumento_codigo
        FROM calificaciones c
        JOIN instrumentos i ON c.instrumento_id = i.instrumento_id
        WHERE (c.usuario_id = $1 OR $2)
        "#,
    );
    if params.ejercicio.is_some() {
        query.push_str(" AND c.ejercicio = $3 ORDER BY c.fecha_creacion DESC LIMIT $4");
    } else {
        query.push_str(" ORDER BY c.fecha_creacion DESC LIMIT $3");
    }

    let mut q = sqlx::query(&query)
        .bind(user.usuario_id)
        .bind(user.es_privilegiado);
    if let Some(ejercicio) = params.ejercicio {
        q = q.bind(ejercicio);
    }
    q = q.bind(limit);

    match q.fetch_all(&state.pool).await {
        Ok(rows) => {
            let mut records = Vec::with_capacity(rows.len());
            for row in &rows {
                match qualification_from_row(row) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        return (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            Json(ErrorResponse {
                                error: e.to_string(),
                            }),
                        )
                            .into_response();
                    }
                }
            }
            Json(serde_json::json!({ "calificaciones": records })).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn create_qualification_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(input): Json<QualificationInput>,
) -> impl IntoResponse {
    let user = match current_user(&state.pool, &headers).await {
        Ok(u) => u,
        Err(r) => return r.into_response(),
    };

    let validated = match validate_input(&input) {
        Ok(v) => v,
        Err(msg) => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ErrorResponse { error: msg }),
            )
                .into_response();
        }
    };

    let sql = insert_statement();
    let mut q = sqlx::query_scalar::<_, i64>(&sql)
        .bind(user.usuario_id)
        .bind(validated.instrumento_id)
        .bind(validated.ejercicio)
        .bind(validated.secuencia_evento)
        .bind(validated.fecha_pago)
        .bind(validated.valor_historico)
        .bind(validated.factor_actualizacion)
        .bind(validated.monto_total)
        .bind("Manual")
        .bind(user.usuario_id);
    for factor in &validated.factors {
        q = q.bind(*factor);
    }

    match q.fetch_one(&state.pool).await {
        Ok(id) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "calificacion_id": id })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn update_qualification_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(input): Json<QualificationInput>,
) -> impl IntoResponse {
    let user = match current_user(&state.pool, &headers).await {
        Ok(u) => u,
        Err(r) => return r.into_response(),
    };

    let validated = match validate_input(&input) {
        Ok(v) => v,
        Err(msg) => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ErrorResponse { error: msg }),
            )
                .into_response();
        }
    };

    let sql = update_statement();
    let mut q = sqlx::query(&sql)
        .bind(validated.instrumento_id)
        .bind(validated.ejercicio)
        .bind(validated.secuencia_evento)
        .bind(validated.fecha_pago)
        .bind(validated.valor_historico)
        .bind(validated.factor_actualizacion)
        .bind(validated.monto_total)
        .bind(user.usuario_id);
    for factor in &validated.factors {
        q = q.bind(*factor);
    }
    q = q.bind(id).bind(user.usuario_id).bind(user.es_privilegiado);

    match q.execute(&state.pool).await {
        Ok(result) if result.rows_affected() == 0 => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Record not found".to_string(),
            }),
        )
            .into_response(),
        Ok(_) => Json(serde_json::json!({ "updated": id })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn delete_qualification_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let user = match current_user(&state.pool, &headers).await {
        Ok(u) => u,
        Err(r) => return r.into_response(),
    };

    // Same ownership constraint as edit: a non-owner gets not-found, never
    // a hint that the id exists
    let result = sqlx::query(
        "DELETE FROM calificaciones WHERE calificacion_id = $1 AND (usuario_id = $2 OR $3)",
    )
    .bind(id)
    .bind(user.usuario_id)
    .bind(user.es_privilegiado)
    .execute(&state.pool)
    .await;

    match result {
        Ok(r) if r.rows_affected() == 0 => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Record not found".to_string(),
            }),
        )
            .into_response(),
        Ok(_) => Json(serde_json::json!({ "deleted": id })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;
    let bind = std::env::var("API_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

    println!("=== Calificación Tributaria API ===");
    println!("Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await
        .context("Failed to connect to database")?;

    println!("Database connected");

    let state = Arc::new(AppState { pool });

    // CORS for web frontend
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/esquema", get(schema_handler))
        .route("/instrumentos", get(instruments_handler))
        .route(
            "/calificaciones",
            get(list_qualifications_handler).post(create_qualification_handler),
        )
        .route(
            "/calificaciones/:id",
            put(update_qualification_handler).delete(delete_qualification_handler),
        )
        .layer(cors)
        .with_state(state);

    println!("API listening on http://{}", bind);
    println!("\nEndpoints:");
    println!("  GET    /health");
    println!("  GET    /esquema");
    println!("  GET    /instrumentos?query=&limit=");
    println!("  GET    /calificaciones?ejercicio=&limit=");
    println!("  POST   /calificaciones");
    println!("  PUT    /calificaciones/:id");
    println!("  DELETE /calificaciones/:id");

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
