use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use relationship_engine::config;
use relationship_engine::db::{self, NewTemplate};
use relationship_engine::model::Anchor;
use serde_json::json;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Insert the default relationship template catalog for a tenant"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Tenant receiving the catalog
    #[arg(long)]
    tenant: String,

    /// Print the catalog as JSON without touching the database
    #[arg(long)]
    print_only: bool,
}

struct Seed {
    code: &'static str,
    title: &'static str,
    anchor: Anchor,
    offset: &'static str,
    message_v1: &'static str,
    message_v2: Option<&'static str>,
    statuses: &'static [&'static str],
    classification_tag: &'static str,
}

const CATALOG: &[Seed] = &[
    Seed {
        code: "MSG1",
        title: "Logo após a venda",
        anchor: Anchor::SaleClose,
        offset: "+0d",
        message_v1: "Olá [Nome do Cliente], estou muito feliz em começar essa jornada com você! Se precisar de qualquer coisa, estarei à disposição.",
        message_v2: Some("Oi [PrimeiroNome], seja bem-vindo(a)! Qualquer dúvida, conte comigo."),
        statuses: &["active", "onboarding"],
        classification_tag: "onboarding",
    },
    Seed {
        code: "MSG2",
        title: "Véspera do primeiro treino",
        anchor: Anchor::FirstWorkout,
        offset: "-1d",
        message_v1: "Oi [PrimeiroNome], amanhã ([DataTreino]) é o grande dia! Antes do treino, preencha sua anamnese: [LinkAnamnese]",
        message_v2: Some("Ei [PrimeiroNome], preparado(a) para o treino de amanhã? Anamnese: [LinkAnamnese]"),
        statuses: &["active", "onboarding"],
        classification_tag: "onboarding",
    },
    Seed {
        code: "MSG3",
        title: "Após o primeiro treino",
        anchor: Anchor::FirstWorkout,
        offset: "+0d",
        message_v1: "Parabéns pelo treino de hoje, [PrimeiroNome]! Como está se sentindo?",
        message_v2: None,
        statuses: &["active"],
        classification_tag: "onboarding",
    },
    Seed {
        code: "MSG4",
        title: "Acompanhamento semanal",
        anchor: Anchor::WeeklyFollowup,
        offset: "+7d",
        message_v1: "[SaudacaoTemporal], [PrimeiroNome]! Seu último treino foi em [DataUltimoTreino]. Tem algo que possamos ajustar no plano?",
        message_v2: Some("Oi [PrimeiroNome], como estão os treinos? Vamos evoluir juntos!"),
        statuses: &["active"],
        classification_tag: "retention",
    },
    Seed {
        code: "MSG6",
        title: "Revisão mensal de progresso",
        anchor: Anchor::MonthlyReview,
        offset: "+0d",
        message_v1: "Olá, [PrimeiroNome]! Já são [MesesAtivo] meses juntos. Vamos revisar o que alcançamos e traçar as metas do próximo mês?",
        message_v2: None,
        statuses: &["active"],
        classification_tag: "retention",
    },
    Seed {
        code: "MSG8",
        title: "Aniversário",
        anchor: Anchor::Birthday,
        offset: "+0d",
        message_v1: "Parabéns pelo seu aniversário, [PrimeiroNome]! Que seus [Idade] anos tragam ainda mais força e saúde.",
        message_v2: Some("Feliz aniversário, [Nome]! Conte comigo nessa jornada."),
        statuses: &["active", "onboarding"],
        classification_tag: "special_dates",
    },
    Seed {
        code: "RENEWAL_7D",
        title: "Lembrete de renovação",
        anchor: Anchor::RenewalWindow,
        offset: "-7d",
        message_v1: "Oi [PrimeiroNome], seu plano [NomePlano] vence em [DataVencimento]. Para renovar: [LinkPagamento]",
        message_v2: None,
        statuses: &["active"],
        classification_tag: "renewal",
    },
    Seed {
        code: "OCCURRENCE_FOLLOWUP",
        title: "Retorno de ocorrência",
        anchor: Anchor::OccurrenceFollowup,
        offset: "+0d",
        message_v1: "Oi [PrimeiroNome], passando para saber como está a situação registrada em [DataOcorrencia] ([TipoOcorrencia]: [DescricaoOcorrencia]).",
        message_v2: None,
        statuses: &[],
        classification_tag: "support",
    },
];

fn catalog_for(tenant_id: &str, channel: &str) -> Vec<NewTemplate> {
    CATALOG
        .iter()
        .map(|seed| NewTemplate {
            tenant_id: tenant_id.to_string(),
            code: seed.code.to_string(),
            title: seed.title.to_string(),
            anchor: seed.anchor.as_str().to_string(),
            channel: channel.to_string(),
            offset: seed.offset.to_string(),
            message_v1: seed.message_v1.to_string(),
            message_v2: seed.message_v2.map(str::to_string),
            audience_filter: (!seed.statuses.is_empty()).then(|| json!({ "status": seed.statuses })),
            variables: relationship_engine::render::extract_variables(seed.message_v1),
            classification_tag: Some(seed.classification_tag.to_string()),
            active: true,
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let templates = catalog_for(&args.tenant, &cfg.engine.default_channel);

    if args.print_only {
        let listing: Vec<_> = templates
            .iter()
            .map(|t| {
                json!({
                    "code": t.code,
                    "anchor": t.anchor,
                    "offset": t.offset,
                    "audience_filter": t.audience_filter,
                    "variables": t.variables,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    cfg.ensure_dirs()?;
    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let now = chrono::Utc::now();
    let (mut inserted, mut skipped) = (0usize, 0usize);
    for template in &templates {
        match db::insert_template_if_absent(&pool, template, now).await? {
            Some(id) => {
                info!(code = %template.code, id, "template seeded");
                inserted += 1;
            }
            None => skipped += 1,
        }
    }
    info!(tenant = %args.tenant, inserted, skipped, "seeding complete");
    Ok(())
}
