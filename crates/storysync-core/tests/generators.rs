use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;
use storysync_core::graph::{Dependency, DependencyType};
use storysync_core::model::{EntityFields, Field, FieldValue};

/// Words drawn from a tiny alphabet so generated triples collide often.
pub fn arb_word() -> impl Strategy<Value = String> + Clone {
    prop_oneof![
        Just("alpha".to_string()),
        Just("Beta".to_string()),
        Just("gamma".to_string()),
        Just("  ALPHA ".to_string()),
    ]
}

pub fn arb_text() -> impl Strategy<Value = String> + Clone {
    prop::collection::vec(arb_word(), 0..3).prop_map(|words| words.join(" "))
}

pub fn arb_field() -> impl Strategy<Value = Field> + Clone {
    prop::sample::select(Field::ALL.to_vec())
}

pub fn arb_fields() -> impl Strategy<Value = EntityFields> + Clone {
    (
        arb_text(),
        arb_text(),
        prop_oneof![Just("To Do"), Just("In Progress"), Just("Done"), Just("done")],
        prop::option::of(prop_oneof![Just("High"), Just("low")]),
        prop::option::of(0u32..5),
        prop::option::of(prop_oneof![Just("ana"), Just("Bo")]),
        prop::collection::vec(arb_word(), 0..3),
    )
        .prop_map(
            |(title, description, status, priority, story_points, assignee, labels)| EntityFields {
                title,
                description,
                status: status.to_string(),
                priority: priority.map(str::to_string),
                story_points,
                assignee: assignee.map(str::to_string),
                labels,
                links: Vec::new(),
            },
        )
}

/// A value of the right shape for `field` (links are left empty).
pub fn arb_value(field: Field) -> BoxedStrategy<FieldValue> {
    match field {
        Field::StoryPoints => prop::option::of(0u32..5)
            .prop_map(|n| n.map_or(FieldValue::Empty, FieldValue::Number))
            .boxed(),
        Field::Labels => prop::collection::vec(arb_word(), 0..3)
            .prop_map(FieldValue::list)
            .boxed(),
        Field::Links => Just(FieldValue::Empty).boxed(),
        _ => arb_text().prop_map(FieldValue::text).boxed(),
    }
}

pub fn arb_timestamp() -> impl Strategy<Value = Option<DateTime<Utc>>> + Clone {
    prop::option::of((1_600_000_000i64..1_600_000_100).prop_map(|secs| {
        Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
    }))
}

/// Node names `n0..n{size}` and `depends_on` edges between them,
/// self-loops included.
pub fn arb_graph(size: usize) -> impl Strategy<Value = (Vec<String>, Vec<Dependency>)> {
    let nodes: Vec<String> = (0..size).map(|i| format!("n{i}")).collect();
    prop::collection::vec((0..size, 0..size), 0..size * 2).prop_map(move |edges| {
        let deps = edges
            .into_iter()
            .map(|(a, b)| Dependency::new(format!("n{a}"), format!("n{b}"), DependencyType::DependsOn))
            .collect();
        (nodes.clone(), deps)
    })
}
