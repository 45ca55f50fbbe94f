use criterion::{criterion_group, criterion_main, Criterion};
use regtrace_core::{
    extract_requirements, fingerprint_text, CrossrefModel, Regulation, RegulationId,
    RequirementId, RequirementRecord, SentenceSegmenter, SourceSystem,
};
use time::OffsetDateTime;

fn mk_regulation(clauses: usize) -> Regulation {
    let mut text = String::new();
    for index in 0..clauses {
        if index % 3 == 0 {
            text.push_str("This chapter lays down definitions for battery categories. ");
        } else {
            text.push_str(&format!(
                "Manufacturers shall ensure traceability of battery lot {index} by QR code. "
            ));
        }
    }

    Regulation {
        id: RegulationId::new("EU-BENCH-2023"),
        version: 1,
        country: "EU".to_string(),
        source: SourceSystem::Manual,
        title: "Benchmark battery regulation".to_string(),
        published_at: OffsetDateTime::UNIX_EPOCH,
        created_at: OffsetDateTime::UNIX_EPOCH,
        fingerprint: fingerprint_text(&text),
        text,
        url: None,
    }
}

fn mk_requirement(index: usize) -> RequirementRecord {
    RequirementRecord {
        id: RequirementId::new(format!("EU-BENCH-2023-v1-R{index:03}")),
        regulation_id: RegulationId::new("EU-BENCH-2023"),
        regulation_version: 1,
        seq: u32::try_from(index).unwrap_or(u32::MAX),
        text_raw: format!("Battery software update {index} must remain traceable"),
        text_engineering: format!("Battery software update {index} must remain traceable."),
        created_at: OffsetDateTime::UNIX_EPOCH,
    }
}

fn bench_extraction(c: &mut Criterion) {
    let regulation = mk_regulation(1_000);

    c.bench_function("extract_requirements_1000_clauses", |b| {
        b.iter(|| {
            let records =
                extract_requirements(&regulation, &SentenceSegmenter, OffsetDateTime::UNIX_EPOCH);
            if let Err(err) = records {
                panic!("extraction benchmark failed: {err}");
            }
        });
    });
}

fn bench_impact_resolution(c: &mut Criterion) {
    let model = CrossrefModel::builtin();
    let requirements = (0..1_000).map(mk_requirement).collect::<Vec<_>>();

    c.bench_function("resolve_impact_1000_requirements", |b| {
        b.iter(|| {
            for requirement in &requirements {
                let assessment = model.resolve(requirement);
                if assessment.components.is_empty() {
                    panic!("benchmark fixture should always match the crossref model");
                }
            }
        });
    });
}

criterion_group!(extraction_benches, bench_extraction, bench_impact_resolution);
criterion_main!(extraction_benches);
