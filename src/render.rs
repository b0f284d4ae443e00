//! Placeholder substitution for template bodies.
//!
//! Tokens are bracketed names such as `[PrimeiroNome]`. Known tokens are
//! replaced by subject-derived values; unknown tokens are left verbatim so a
//! reviewer can spot them in the rendered message.

use crate::clock::LocalCalendar;
use crate::model::{Occurrence, Subject};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\[\]]+)\]").expect("valid placeholder pattern"));

const DEFAULT_APP_URL: &str = "http://localhost:3000";

/// Token name (without brackets) to substituted value.
pub type VariableMap = HashMap<&'static str, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub text: String,
    /// Bracketed tokens that were substituted, in first-seen order.
    pub used: Vec<String>,
}

pub fn render(body: &str, vars: &VariableMap) -> Rendered {
    let mut used: Vec<String> = Vec::new();
    let text = TOKEN_RE
        .replace_all(body, |caps: &regex::Captures<'_>| {
            let whole = &caps[0];
            match vars.get(caps[1].trim()) {
                Some(value) => {
                    if !used.iter().any(|u| u == whole) {
                        used.push(whole.to_string());
                    }
                    value.clone()
                }
                None => whole.to_string(),
            }
        })
        .into_owned();
    Rendered { text, used }
}

/// All bracketed tokens of a body, known or not.
pub fn extract_variables(body: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for m in TOKEN_RE.find_iter(body) {
        if !out.iter().any(|v| v == m.as_str()) {
            out.push(m.as_str().to_string());
        }
    }
    out
}

pub fn greeting(hour: u32) -> &'static str {
    match hour {
        5..=11 => "Bom dia",
        12..=17 => "Boa tarde",
        _ => "Boa noite",
    }
}

pub fn format_date(date: NaiveDate) -> String {
    date.format("%d/%m/%Y").to_string()
}

fn format_opt(date: Option<NaiveDate>) -> String {
    date.map(format_date).unwrap_or_default()
}

/// Completed years between `birth` and `today`.
pub fn age_on(birth: NaiveDate, today: NaiveDate) -> i32 {
    let mut age = today.year() - birth.year();
    if (today.month(), today.day()) < (birth.month(), birth.day()) {
        age -= 1;
    }
    age.max(0)
}

fn months_between(from: NaiveDate, to: NaiveDate) -> i32 {
    let months = (to.year() - from.year()) * 12 + to.month() as i32 - from.month() as i32;
    months.max(0)
}

/// Inputs the variable map is derived from.
pub struct RenderContext<'a> {
    pub subject: &'a Subject,
    pub calendar: &'a LocalCalendar,
    /// Tenant-local wall clock at render time.
    pub local_now: NaiveDateTime,
    pub occurrence: Option<&'a Occurrence>,
    pub app_url: &'a str,
}

pub fn build_variables(ctx: &RenderContext<'_>) -> VariableMap {
    let s = ctx.subject;
    let today = ctx.local_now.date();
    let base_url = if ctx.app_url.trim().is_empty() {
        DEFAULT_APP_URL
    } else {
        ctx.app_url.trim_end_matches('/')
    };
    let plan = s.plan_name.clone().unwrap_or_default();
    let created = ctx.calendar.local_date(s.created_at);

    let mut vars = VariableMap::new();
    vars.insert("Nome", s.name.clone());
    vars.insert("Nome do Aluno", s.name.clone());
    vars.insert("Nome do Cliente", s.name.clone());
    vars.insert("PrimeiroNome", s.first_name().to_string());
    vars.insert("Sobrenome", s.last_names());
    vars.insert("Email", s.email.clone().unwrap_or_default());
    vars.insert("Telefone", s.phone.clone().unwrap_or_default());
    vars.insert("SaudacaoTemporal", greeting(ctx.local_now.hour()).to_string());
    vars.insert("DataVenda", format_date(created));
    vars.insert("DataInicio", format_opt(s.first_workout_date));
    vars.insert("DataNascimento", format_opt(s.birth_date));
    vars.insert(
        "Idade",
        s.birth_date
            .map(|b| age_on(b, today).to_string())
            .unwrap_or_default(),
    );
    vars.insert("MesesAtivo", months_between(created, today).to_string());
    vars.insert("DataAtual", format_date(today));
    vars.insert("HoraAtual", ctx.local_now.format("%H:%M").to_string());
    vars.insert("DataTreino", format_opt(s.first_workout_date));
    vars.insert("DataUltimoTreino", format_opt(s.last_workout_date));
    vars.insert("NomePlano", plan.clone());
    vars.insert("PlanoAtual", plan);
    vars.insert("DataVencimento", format_opt(s.next_renewal_date));
    vars.insert(
        "DiasRestantes",
        s.next_renewal_date
            .map(|d| (d - today).num_days().to_string())
            .unwrap_or_default(),
    );
    vars.insert("LinkAnamnese", format!("{base_url}/anamnese/public/{}", s.id));
    vars.insert("LinkPagamento", format!("{base_url}/payment/{}", s.id));
    vars.insert("NomePersonal", s.trainer_name.clone().unwrap_or_default());

    if let Some(occ) = ctx.occurrence {
        vars.insert("TipoOcorrencia", occ.kind.clone());
        vars.insert("DescricaoOcorrencia", occ.description.clone().unwrap_or_default());
        vars.insert("DataOcorrencia", format_date(ctx.calendar.local_date(occ.created_at)));
    }
    vars
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn subject() -> Subject {
        Subject {
            id: "stu-1".into(),
            tenant_id: "t1".into(),
            name: "Joana Prado Lima".into(),
            email: Some("joana@example.com".into()),
            phone: None,
            status: "active".into(),
            tags: vec![],
            plan_name: Some("Mensal".into()),
            trainer_id: None,
            trainer_name: Some("Carlos".into()),
            created_at: Utc.with_ymd_and_hms(2025, 11, 20, 15, 0, 0).unwrap(),
            first_workout_date: NaiveDate::from_ymd_opt(2025, 11, 25),
            last_workout_date: None,
            birth_date: NaiveDate::from_ymd_opt(1990, 3, 10),
            next_renewal_date: NaiveDate::from_ymd_opt(2026, 3, 20),
        }
    }

    fn local_now(h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 9)
            .unwrap()
            .and_hms_opt(h, 30, 0)
            .unwrap()
    }

    #[test]
    fn substitutes_known_tokens_and_keeps_unknown() {
        let s = subject();
        let cal = LocalCalendar::utc();
        let vars = build_variables(&RenderContext {
            subject: &s,
            calendar: &cal,
            local_now: local_now(8),
            occurrence: None,
            app_url: "https://app.example.com/",
        });
        let out = render(
            "[SaudacaoTemporal], [PrimeiroNome]! Faltam [DiasRestantes] dias. [Desconhecido] [PrimeiroNome]",
            &vars,
        );
        assert_eq!(out.text, "Bom dia, Joana! Faltam 11 dias. [Desconhecido] Joana");
        assert_eq!(out.used, vec!["[SaudacaoTemporal]", "[PrimeiroNome]", "[DiasRestantes]"]);

        let out = render("[LinkAnamnese] [Idade] [DataNascimento] [Sobrenome]", &vars);
        assert_eq!(
            out.text,
            "https://app.example.com/anamnese/public/stu-1 35 10/03/1990 Prado Lima"
        );
    }

    #[test]
    fn greeting_boundaries() {
        assert_eq!(greeting(4), "Boa noite");
        assert_eq!(greeting(5), "Bom dia");
        assert_eq!(greeting(11), "Bom dia");
        assert_eq!(greeting(12), "Boa tarde");
        assert_eq!(greeting(17), "Boa tarde");
        assert_eq!(greeting(18), "Boa noite");
    }

    #[test]
    fn age_counts_completed_years() {
        let birth = NaiveDate::from_ymd_opt(1990, 3, 10).unwrap();
        assert_eq!(age_on(birth, NaiveDate::from_ymd_opt(2026, 3, 9).unwrap()), 35);
        assert_eq!(age_on(birth, NaiveDate::from_ymd_opt(2026, 3, 10).unwrap()), 36);
    }

    #[test]
    fn extract_lists_each_token_once() {
        assert_eq!(
            extract_variables("Oi [Nome], [Nome] e [Plano X]"),
            vec!["[Nome]", "[Plano X]"]
        );
        assert!(extract_variables("sem tokens").is_empty());
    }
}
