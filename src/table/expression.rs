//! Rendering of update requests into DynamoDB expression syntax.
//!
//! Every attribute name goes through a `#aN` placeholder and every value
//! through a `:vN` placeholder, so attribute names never collide with
//! reserved words.

use std::collections::HashMap;

use super::item::{AttributeValue, Condition, UpdateAction, UpdateRequest};

/// The expression parts of one `UpdateItem` call.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Expressions {
    pub(crate) update: String,
    pub(crate) condition: Option<String>,
    pub(crate) names: HashMap<String, String>,
    pub(crate) values: HashMap<String, AttributeValue>,
}

#[derive(Default)]
struct Placeholders {
    names: HashMap<String, String>,
    values: HashMap<String, AttributeValue>,
}

impl Placeholders {
    fn name(&mut self, attribute: &str) -> String {
        if let Some((placeholder, _)) = self.names.iter().find(|(_, name)| *name == attribute) {
            return placeholder.clone();
        }

        let placeholder = format!("#a{}", self.names.len());
        self.names.insert(placeholder.clone(), attribute.to_string());
        placeholder
    }

    fn value(&mut self, value: AttributeValue) -> String {
        let placeholder = format!(":v{}", self.values.len());
        self.values.insert(placeholder.clone(), value);
        placeholder
    }
}

/// Render the actions and condition of `request`.
pub(crate) fn render(request: &UpdateRequest) -> Expressions {
    let mut placeholders = Placeholders::default();
    let mut sets = Vec::new();
    let mut adds = Vec::new();

    for action in &request.actions {
        match action {
            UpdateAction::Set(name, value) => {
                let name = placeholders.name(name);
                let value = placeholders.value(value.clone());
                sets.push(format!("{} = {}", name, value));
            }
            UpdateAction::Add(name, delta) => {
                let name = placeholders.name(name);
                let value = placeholders.value(AttributeValue::N(*delta));
                adds.push(format!("{} {}", name, value));
            }
        }
    }

    let mut clauses = Vec::new();
    if !sets.is_empty() {
        clauses.push(format!("SET {}", sets.join(", ")));
    }
    if !adds.is_empty() {
        clauses.push(format!("ADD {}", adds.join(", ")));
    }

    let condition = request
        .condition
        .as_ref()
        .map(|condition| render_condition(condition, &mut placeholders));

    Expressions {
        update: clauses.join(" "),
        condition,
        names: placeholders.names,
        values: placeholders.values,
    }
}

fn render_condition(condition: &Condition, placeholders: &mut Placeholders) -> String {
    match condition {
        Condition::AttributeNotExists(name) => {
            format!("attribute_not_exists({})", placeholders.name(name))
        }
        Condition::GreaterThanOrEqual(name, value) => compare(name, ">=", *value, placeholders),
        Condition::LessThan(name, value) => compare(name, "<", *value, placeholders),
        Condition::Equals(name, value) => compare(name, "=", *value, placeholders),
        Condition::Or(conditions) => group(conditions, " OR ", placeholders),
        Condition::And(conditions) => group(conditions, " AND ", placeholders),
    }
}

fn compare(name: &str, op: &str, value: f64, placeholders: &mut Placeholders) -> String {
    let name = placeholders.name(name);
    let value = placeholders.value(AttributeValue::N(value));
    format!("{} {} {}", name, op, value)
}

fn group(conditions: &[Condition], op: &str, placeholders: &mut Placeholders) -> String {
    let parts: Vec<String> = conditions
        .iter()
        .map(|condition| render_condition(condition, placeholders))
        .collect();
    format!("({})", parts.join(op))
}
