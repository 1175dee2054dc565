// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Normalization of raw result documents into the canonical plan model.
//!
//! Result documents have drifted across backend versions: meals may sit at the
//! top level or one object deeper, and the same value appears under several
//! names. Every canonical field is therefore read through an ordered chain of
//! accessor paths (see the `*_FIELDS` tables below); the first path that holds a
//! usable value wins, otherwise a literal default applies. Supporting a new
//! backend variant means adding a path to a table.
//!
//! Everything here is pure and synchronous. Documents that cannot produce at
//! least one meal are dropped and logged, never surfaced as errors.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::types::{
    Applicability, CanonicalMeal, CanonicalPlan, Difficulty, JobKind, RawResultDocument,
};

/// A path of object keys, e.g. `["plan", "meals"]`.
type FieldPath = &'static [&'static str];

/// Ordered accessor chain for one canonical field.
type FieldChain = &'static [FieldPath];

const PLAN_ID_FIELDS: FieldChain = &[&["_id"], &["id"], &["planId"], &["plan_id"]];

const PLAN_CORRELATION_FIELDS: FieldChain = &[
    &["correlationId"],
    &["correlation_id"],
    &["requestId"],
    &["request_id"],
    &["request", "correlationId"],
    &["metadata", "correlationId"],
];

const PLAN_CREATED_AT_FIELDS: FieldChain = &[
    &["createdAt"],
    &["created_at"],
    &["_creationTime"],
    &["timestamp"],
    &["generatedAt"],
];

const PLAN_TITLE_FIELDS: FieldChain = &[
    &["title"],
    &["planTitle"],
    &["plan", "title"],
    &["result", "title"],
];

const PLAN_GREETING_FIELDS: FieldChain = &[
    &["greeting"],
    &["message"],
    &["intro"],
    &["plan", "greeting"],
    &["result", "greeting"],
];

/// Home meal arrays, top level first, then one level deeper.
const HOME_MEALS_FIELDS: FieldChain = &[
    &["meals"],
    &["recipes"],
    &["plan", "meals"],
    &["plan", "recipes"],
    &["result", "meals"],
    &["result", "recipes"],
];

const AWAY_ENTRIES_FIELDS: FieldChain = &[
    &["recommendations"],
    &["restaurants"],
    &["places"],
    &["plan", "recommendations"],
    &["result", "recommendations"],
    &["result", "restaurants"],
];

const MEAL_LABEL_FIELDS: FieldChain = &[
    &["label"],
    &["mealType"],
    &["meal_type"],
    &["slot"],
    &["course"],
];

const MEAL_TITLE_FIELDS: FieldChain = &[&["title"], &["name"], &["recipeName"], &["dish"]];

const MEAL_TIME_FIELDS: FieldChain = &[
    &["estimatedTime"],
    &["estimated_time"],
    &["totalTime"],
    &["cookTime"],
    &["time"],
    &["prepTime"],
];

const MEAL_DIFFICULTY_FIELDS: FieldChain = &[&["difficulty"], &["level"], &["skill"]];

const MEAL_CALORIES_FIELDS: FieldChain = &[
    &["caloriesPerServing"],
    &["calories_per_serving"],
    &["calories"],
    &["nutrition", "calories"],
    &["kcal"],
];

const MEAL_PANTRY_NOTE_FIELDS: FieldChain = &[
    &["pantryMatchNote"],
    &["pantry_match_note"],
    &["pantryMatch"],
    &["pantryNote"],
];

const MEAL_INGREDIENTS_FIELDS: FieldChain = &[&["ingredients"], &["ingredientList"], &["items"]];

const MEAL_STEPS_FIELDS: FieldChain = &[
    &["steps"],
    &["instructions"],
    &["method"],
    &["directions"],
];

const CUISINE_FIELDS: FieldChain = &[&["cuisine"], &["cuisineType"], &["cuisine_type"]];

const VENUE_LABEL_FIELDS: FieldChain = &[&["label"], &["category"], &["type"]];

const VENUE_TITLE_FIELDS: FieldChain = &[
    &["name"],
    &["restaurantName"],
    &["title"],
    &["venue", "name"],
];

const VENUE_NOTE_FIELDS: FieldChain = &[
    &["pantryMatchNote"],
    &["reason"],
    &["why"],
    &["description"],
    &["summary"],
];

const VENUE_DISHES_FIELDS: FieldChain = &[
    &["dishes"],
    &["suggestedDishes"],
    &["menuHighlights"],
    &["recommendedDishes"],
];

const VENUE_TIPS_FIELDS: FieldChain = &[&["tips"], &["notes"], &["highlights"]];

/// Keys tried, in order, when a list element is an object rather than a string.
const LIST_ITEM_TEXT_KEYS: &[&str] = &["text", "step", "instruction", "description", "name", "item"];

const DEFAULT_HOME_TITLE: &str = "Your meal plan";
const DEFAULT_AWAY_TITLE: &str = "Places to eat";
const DEFAULT_MEAL_TITLE: &str = "Untitled meal";
const DEFAULT_VENUE_TITLE: &str = "Unnamed venue";

/// Why a document was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedDocument {
    #[error("document is not a JSON object")]
    NotAnObject,

    #[error("no {0} array found")]
    MissingEntries(&'static str),

    #[error("{0} array yielded no usable entries")]
    NoUsableEntries(&'static str),
}

/// Normalize one raw document. Returns `None` when the document yields no meals.
pub fn normalize(raw: &RawResultDocument, kind: JobKind) -> Option<CanonicalPlan> {
    match try_normalize(raw, kind) {
        Ok(plan) => Some(plan),
        Err(reason) => {
            debug!(
                kind = %kind,
                document_id = ?first_text(raw, PLAN_ID_FIELDS),
                reason = %reason,
                "Dropping malformed result document"
            );
            None
        }
    }
}

/// Normalize every document of a stream snapshot, dropping the malformed ones.
pub fn normalize_snapshot(docs: &[RawResultDocument], kind: JobKind) -> Vec<CanonicalPlan> {
    let plans: Vec<CanonicalPlan> = docs.iter().filter_map(|doc| normalize(doc, kind)).collect();
    if plans.len() < docs.len() {
        debug!(
            kind = %kind,
            received = docs.len(),
            kept = plans.len(),
            "Snapshot contained malformed documents"
        );
    }
    plans
}

/// Like [`normalize`], but reports why a document was dropped.
pub fn try_normalize(
    raw: &RawResultDocument,
    kind: JobKind,
) -> Result<CanonicalPlan, MalformedDocument> {
    if !raw.is_object() {
        return Err(MalformedDocument::NotAnObject);
    }

    let meals = match kind {
        JobKind::Home => home_meals(raw)?,
        JobKind::Away => away_meals(raw)?,
    };

    let correlation_id = first_text(raw, PLAN_CORRELATION_FIELDS);
    let created_at_field = first_with(raw, PLAN_CREATED_AT_FIELDS, timestamp_of);
    let created_at = created_at_field.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

    let id = first_text(raw, PLAN_ID_FIELDS)
        .or_else(|| correlation_id.as_ref().map(|c| format!("{}-{}", kind, c)))
        .unwrap_or_else(|| format!("{}-{}", kind, created_at.timestamp_millis()));

    let default_title = match kind {
        JobKind::Home => DEFAULT_HOME_TITLE,
        JobKind::Away => DEFAULT_AWAY_TITLE,
    };

    Ok(CanonicalPlan {
        id,
        kind,
        title: first_text(raw, PLAN_TITLE_FIELDS).unwrap_or_else(|| default_title.to_string()),
        greeting: first_text(raw, PLAN_GREETING_FIELDS).unwrap_or_default(),
        meals,
        created_at,
        correlation_id,
    })
}

fn home_meals(raw: &Value) -> Result<Vec<CanonicalMeal>, MalformedDocument> {
    let entries = first_with(raw, HOME_MEALS_FIELDS, non_empty_array)
        .ok_or(MalformedDocument::MissingEntries("meals"))?;

    let meals: Vec<CanonicalMeal> = entries
        .iter()
        .filter(|entry| entry.is_object())
        .enumerate()
        .map(|(index, entry)| home_meal(entry, index))
        .collect();

    if meals.is_empty() {
        return Err(MalformedDocument::NoUsableEntries("meals"));
    }
    Ok(meals)
}

fn home_meal(entry: &Value, index: usize) -> CanonicalMeal {
    let estimated_time = first_with(entry, MEAL_TIME_FIELDS, duration_text_of)
        .map(Applicability::Known)
        .unwrap_or(Applicability::Unknown);
    let calories = first_with(entry, MEAL_CALORIES_FIELDS, calories_of)
        .map(Applicability::Known)
        .unwrap_or(Applicability::Unknown);

    CanonicalMeal {
        label: first_text(entry, MEAL_LABEL_FIELDS).unwrap_or_else(|| format!("Meal {}", index + 1)),
        title: first_text(entry, MEAL_TITLE_FIELDS).unwrap_or_else(|| DEFAULT_MEAL_TITLE.to_string()),
        estimated_time,
        difficulty: first_text(entry, MEAL_DIFFICULTY_FIELDS)
            .map(|label| Difficulty::parse(&label))
            .unwrap_or(Difficulty::Unrated),
        calories_per_serving: calories,
        pantry_match_note: first_text(entry, MEAL_PANTRY_NOTE_FIELDS).unwrap_or_default(),
        ingredients: first_with(entry, MEAL_INGREDIENTS_FIELDS, ingredient_list_of)
            .unwrap_or_default(),
        steps: first_with(entry, MEAL_STEPS_FIELDS, text_list_of).unwrap_or_default(),
        cuisine: first_text(entry, CUISINE_FIELDS),
    }
}

fn away_meals(raw: &Value) -> Result<Vec<CanonicalMeal>, MalformedDocument> {
    let entries = first_with(raw, AWAY_ENTRIES_FIELDS, non_empty_array)
        .ok_or(MalformedDocument::MissingEntries("recommendations"))?;

    let meals: Vec<CanonicalMeal> = entries
        .iter()
        .filter(|entry| entry.is_object())
        .enumerate()
        .map(|(index, entry)| venue_meal(entry, index))
        .collect();

    if meals.is_empty() {
        return Err(MalformedDocument::NoUsableEntries("recommendations"));
    }
    Ok(meals)
}

fn venue_meal(entry: &Value, index: usize) -> CanonicalMeal {
    CanonicalMeal {
        label: first_text(entry, VENUE_LABEL_FIELDS)
            .unwrap_or_else(|| format!("Option {}", index + 1)),
        title: first_text(entry, VENUE_TITLE_FIELDS)
            .unwrap_or_else(|| DEFAULT_VENUE_TITLE.to_string()),
        estimated_time: Applicability::NotApplicable,
        difficulty: Difficulty::ExternalVenue,
        calories_per_serving: Applicability::NotApplicable,
        pantry_match_note: first_text(entry, VENUE_NOTE_FIELDS).unwrap_or_default(),
        ingredients: first_with(entry, VENUE_DISHES_FIELDS, text_list_of).unwrap_or_default(),
        steps: first_with(entry, VENUE_TIPS_FIELDS, text_list_of).unwrap_or_default(),
        cuisine: first_text(entry, CUISINE_FIELDS),
    }
}

// ============================================================================
// Accessors
// ============================================================================

fn lookup<'a>(value: &'a Value, path: FieldPath) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, key| current.get(*key))
}

/// First path in `chain` whose value survives `convert`.
fn first_with<'a, T>(
    value: &'a Value,
    chain: FieldChain,
    convert: impl Fn(&'a Value) -> Option<T>,
) -> Option<T> {
    chain
        .iter()
        .filter_map(|path| lookup(value, *path))
        .find_map(convert)
}

fn first_text(value: &Value, chain: FieldChain) -> Option<String> {
    first_with(value, chain, text_of)
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn non_empty_array(value: &Value) -> Option<&Vec<Value>> {
    value.as_array().filter(|entries| !entries.is_empty())
}

/// Epoch milliseconds (integer or float) or an RFC 3339 string.
fn timestamp_of(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let millis = n.as_i64().or_else(|| {
                n.as_f64()
                    .filter(|f| f.is_finite() && f.abs() < i64::MAX as f64)
                    .map(|f| f as i64)
            })?;
            Utc.timestamp_millis_opt(millis).single()
        }
        Value::String(s) => {
            let trimmed = s.trim();
            DateTime::parse_from_rfc3339(trimmed)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    trimmed
                        .parse::<i64>()
                        .ok()
                        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
                })
        }
        _ => None,
    }
}

/// Bare numbers are minutes; text is kept as written.
fn duration_text_of(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => n.as_u64().map(|minutes| format!("{} min", minutes)),
        other => text_of(other),
    }
}

/// Numbers, or the leading digits of text like "450 kcal".
fn calories_of(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.is_finite() && *f >= 0.0)
                    .map(|f| f.round() as u64)
            })
            .and_then(|kcal| u32::try_from(kcal).ok()),
        Value::String(s) => {
            let digits: String = s
                .trim()
                .chars()
                .skip_while(|c| !c.is_ascii_digit())
                .take_while(|c| c.is_ascii_digit())
                .collect();
            digits.parse().ok()
        }
        _ => None,
    }
}

fn list_item_text(item: &Value) -> Option<String> {
    match item {
        Value::Object(_) => LIST_ITEM_TEXT_KEYS
            .iter()
            .filter_map(|key| item.get(*key))
            .find_map(text_of),
        other => text_of(other),
    }
}

/// Arrays of strings or objects, or a single newline-separated string.
fn text_list_of(value: &Value) -> Option<Vec<String>> {
    let items: Vec<String> = match value {
        Value::Array(entries) => entries.iter().filter_map(list_item_text).collect(),
        Value::String(s) => s
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect(),
        _ => return None,
    };
    (!items.is_empty()).then_some(items)
}

/// Like [`text_list_of`], but `{ "name": "rice", "quantity": "1 cup" }`
/// renders as "1 cup rice".
fn ingredient_list_of(value: &Value) -> Option<Vec<String>> {
    let Value::Array(entries) = value else {
        return text_list_of(value);
    };
    let items: Vec<String> = entries
        .iter()
        .filter_map(|entry| {
            let name = list_item_text(entry)?;
            let quantity = ["quantity", "amount"]
                .iter()
                .filter_map(|key| entry.get(*key))
                .find_map(text_of);
            Some(match quantity {
                Some(quantity) => format!("{} {}", quantity, name),
                None => name,
            })
        })
        .collect();
    (!items.is_empty()).then_some(items)
}
