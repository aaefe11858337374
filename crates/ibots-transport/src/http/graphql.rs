//! GraphQL documents and response decoding.

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::warn;

use ibots_core::api::{EntryQuery, RelationKind};
use ibots_core::{
    ApiError, ApiResult, Bid, BidRegistry, Cents, Entry, EntryKind, EntryPayload, Mutation,
    Timestamp, User, UserKind,
};

/// Standard GraphQL response envelope.
#[derive(Debug, Deserialize)]
pub(crate) struct Response {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub errors: Vec<ErrorMessage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorMessage {
    pub message: String,
}

impl Response {
    /// Returns `data`, turning GraphQL-level errors into rejections.
    pub fn into_data(self) -> ApiResult<Value> {
        if !self.errors.is_empty() {
            let messages: Vec<_> = self.errors.into_iter().map(|e| e.message).collect();
            return Err(ApiError::Rejected(messages.join("; ")));
        }
        self.data
            .ok_or_else(|| ApiError::Serialization("response carries no data".into()))
    }
}

// =============================================================================
// Documents
// =============================================================================

const NODE_REF: &str = "__typename id";

fn list_field(kind: EntryKind) -> &'static str {
    match kind {
        EntryKind::Donation => "donations",
        EntryKind::Transaction => "rewards",
        EntryKind::News => "news",
        EntryKind::Event => "events",
        EntryKind::Post => "posts",
        EntryKind::Comment => "comments",
    }
}

fn payload_fields(kind: EntryKind) -> String {
    match kind {
        EntryKind::Donation | EntryKind::Transaction => {
            format!("amount description target {{ {NODE_REF} }}")
        }
        EntryKind::News | EntryKind::Post => "title description".to_string(),
        EntryKind::Event => format!(
            "title description date duration address rsvp {{ edges {{ node {{ {NODE_REF} }} }} }}"
        ),
        EntryKind::Comment => format!("description parent {{ {NODE_REF} }}"),
    }
}

fn node_type(kind: EntryKind) -> &'static str {
    match kind {
        EntryKind::Donation => "DonationNode",
        EntryKind::Transaction => "RewardNode",
        EntryKind::News => "NewsNode",
        EntryKind::Event => "EventNode",
        EntryKind::Post => "PostNode",
        EntryKind::Comment => "CommentNode",
    }
}

/// Entries of one kind created at or after `since`, oldest first, with the
/// query's filters that apply to `kind`.
pub(crate) fn entry_list(kind: EntryKind, query: &EntryQuery, since: &str) -> (String, Value) {
    let mut declared = vec!["$first: Int!", "$since: DateTime!"];
    let mut args = vec!["first: $first", "created_Gte: $since", "orderBy: \"created\""];
    let mut variables = Map::new();
    variables.insert("first".into(), Value::from(query.limit));
    variables.insert("since".into(), Value::from(since));

    let filters = [
        ("byUser", query.by_user.as_ref()),
        ("hasParent", query.parent.as_ref().filter(|_| kind == EntryKind::Comment)),
        (
            "target",
            query
                .target
                .as_ref()
                .filter(|_| matches!(kind, EntryKind::Donation | EntryKind::Transaction)),
        ),
    ];
    let mut filter_args = Vec::new();
    for (name, bid) in filters {
        if let Some(bid) = bid {
            filter_args.push(name);
            variables.insert(name.into(), Value::from(bid.id()));
        }
    }
    let declared_filters: Vec<String> = filter_args.iter().map(|n| format!("${n}: ID!")).collect();
    let filter_uses: Vec<String> = filter_args.iter().map(|n| format!("{n}: ${n}")).collect();
    declared.extend(declared_filters.iter().map(String::as_str));
    args.extend(filter_uses.iter().map(String::as_str));

    let field = list_field(kind);
    let fields = payload_fields(kind);
    let document = format!(
        "query EntryList({}) {{ {field}({}) {{ \
         edges {{ node {{ {NODE_REF} created user {{ {NODE_REF} }} {fields} }} }} }} }}",
        declared.join(", "),
        args.join(", "),
    );
    (document, Value::Object(variables))
}

/// One entry through the relay `node` field.
pub(crate) fn entry_node(kind: EntryKind) -> String {
    let ty = node_type(kind);
    let fields = payload_fields(kind);
    format!(
        "query EntryNode($id: ID!) {{ node(id: $id) {{ {NODE_REF} \
         ... on {ty} {{ created user {{ {NODE_REF} }} {fields} }} }} }}"
    )
}

fn user_list_field(kind: UserKind) -> &'static str {
    match kind {
        UserKind::Nonprofit => "organizations",
        UserKind::Person => "people",
    }
}

fn user_node_field(kind: UserKind) -> &'static str {
    match kind {
        UserKind::Nonprofit => "organization",
        UserKind::Person => "person",
    }
}

pub(crate) fn user_list(kind: UserKind) -> String {
    let field = user_list_field(kind);
    format!(
        "query UserList($first: Int, $search: String) {{ \
         {field}(first: $first, search: $search) {{ \
         edges {{ node {{ {NODE_REF} username name balance }} }} }} }}"
    )
}

pub(crate) fn user_node(kind: UserKind) -> String {
    let field = user_node_field(kind);
    format!("query UserNode($id: ID!) {{ {field}(id: $id) {{ {NODE_REF} username name balance }} }}")
}

/// Users of `kind` holding `relation` towards `$target`.
pub(crate) fn relation_holders(relation: RelationKind, kind: UserKind) -> String {
    let field = user_list_field(kind);
    let filter = relation_filter(relation);
    format!(
        "query RelationHolders($target: ID!, $first: Int) {{ \
         {field}({filter}: $target, first: $first) {{ edges {{ node {{ {NODE_REF} }} }} }} }}"
    )
}

fn relation_filter(relation: RelationKind) -> &'static str {
    match relation {
        RelationKind::Like => "likeFor",
        RelationKind::Rsvp => "rsvpFor",
        RelationKind::Follow => "followedOf",
    }
}

pub(crate) fn relation_toggle(relation: RelationKind, active: bool) -> String {
    let verb = if active { "create" } else { "delete" };
    let noun = match relation {
        RelationKind::Like => "Like",
        RelationKind::Rsvp => "Rsvp",
        RelationKind::Follow => "Follow",
    };
    format!(
        "mutation Toggle($user: ID!, $target: ID!) {{ \
         {verb}{noun}(user: $user, target: $target) {{ ok }} }}"
    )
}

/// The mutation document and its variables, for an author `user_id`.
pub(crate) fn mutation(user_id: &str, mutation: &Mutation) -> (String, Value) {
    let (field, args, output, variables) = match mutation {
        Mutation::Post { title, description } => (
            "createPost",
            "title: $title, description: $description",
            "post",
            serde_json::json!({ "title": title, "description": description }),
        ),
        Mutation::News { title, description } => (
            "createNews",
            "title: $title, description: $description",
            "news",
            serde_json::json!({ "title": title, "description": description }),
        ),
        Mutation::Comment { parent, description } => (
            "createComment",
            "parent: $parent, description: $description",
            "comment",
            serde_json::json!({ "parent": parent.id(), "description": description }),
        ),
        Mutation::Donation {
            target,
            amount,
            description,
        } => (
            "createDonation",
            "target: $target, amount: $amount, description: $description",
            "donation",
            serde_json::json!({ "target": target.id(), "amount": amount.0, "description": description }),
        ),
        Mutation::Transaction {
            target,
            amount,
            description,
        } => (
            "createReward",
            "target: $target, amount: $amount, description: $description",
            "reward",
            serde_json::json!({ "target": target.id(), "amount": amount.0, "description": description }),
        ),
        Mutation::Event {
            title,
            description,
            date,
            duration,
            address,
        } => (
            "createEvent",
            "title: $title, description: $description, date: $date, duration: $duration, address: $address",
            "event",
            serde_json::json!({
                "title": title,
                "description": description,
                "date": date.to_rfc3339(),
                "duration": duration,
                "address": address,
            }),
        ),
    };

    let mut variables = variables;
    if let Value::Object(map) = &mut variables {
        map.insert("user".into(), Value::String(user_id.to_string()));
    }
    let declared = declare_variables(&variables);
    let document = format!(
        "mutation Create({declared}) {{ {field}(user: $user, {args}) {{ {output} {{ {NODE_REF} }} }} }}"
    );
    (document, variables)
}

fn declare_variables(variables: &Value) -> String {
    let Value::Object(map) = variables else {
        return String::new();
    };
    let mut names: Vec<&String> = map.keys().collect();
    names.sort();
    names
        .into_iter()
        .map(|name| {
            let ty = match name.as_str() {
                "user" | "target" | "parent" => "ID!",
                "amount" | "duration" => "Int!",
                "date" => "DateTime!",
                _ => "String!",
            };
            format!("${name}: {ty}")
        })
        .collect::<Vec<_>>()
        .join(", ")
}

// =============================================================================
// Decoding
// =============================================================================

/// Flattens relay connections: `{edges: [{node: x}]}` becomes `[x]`.
pub(crate) fn collapse(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(collapse).collect()),
        Value::Object(mut map) => {
            if let Some(edges) = map.remove("edges") {
                return collapse(edges);
            }
            if let Some(node) = map.remove("node") {
                return collapse(node);
            }
            Value::Object(map.into_iter().map(|(k, v)| (k, collapse(v))).collect())
        }
        other => other,
    }
}

/// The single top-level field of a `data` object.
pub(crate) fn root(data: Value) -> Value {
    match data {
        Value::Object(map) => map.into_iter().next().map(|(_, v)| v).unwrap_or(Value::Null),
        other => other,
    }
}

fn str_field<'a>(node: &'a Value, key: &str) -> ApiResult<&'a str> {
    node.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::Serialization(format!("missing string field '{key}'")))
}

fn text_field(node: &Value, key: &str) -> String {
    node.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Decodes a `{__typename, id}` reference.
pub(crate) fn parse_bid(node: &Value) -> ApiResult<Bid> {
    let tag = str_field(node, "__typename")?;
    let id = node
        .get("id")
        .and_then(id_string)
        .ok_or_else(|| ApiError::Serialization("missing field 'id'".into()))?;
    Ok(BidRegistry.resolve(&id, tag)?)
}

fn timestamp_field(node: &Value, key: &str) -> ApiResult<Timestamp> {
    let raw = str_field(node, key)?;
    Timestamp::parse_rfc3339(raw)
        .map_err(|e| ApiError::Serialization(format!("bad timestamp '{raw}' in '{key}': {e}")))
}

fn ref_field(node: &Value, key: &str) -> ApiResult<Bid> {
    let inner = node
        .get(key)
        .ok_or_else(|| ApiError::Serialization(format!("missing reference '{key}'")))?;
    parse_bid(inner)
}

/// Decodes one collapsed entry node.
pub(crate) fn parse_entry(node: &Value) -> ApiResult<Entry> {
    let bid = parse_bid(node)?;
    let kind = bid
        .kind()
        .entry_kind()
        .ok_or_else(|| ApiError::Serialization(format!("{bid} is not an entry")))?;
    let created = timestamp_field(node, "created")?;
    let author = ref_field(node, "user")?;

    let payload = match kind {
        EntryKind::Donation | EntryKind::Transaction => {
            let target = ref_field(node, "target")?;
            let amount = node
                .get("amount")
                .and_then(Value::as_i64)
                .map(Cents)
                .ok_or_else(|| ApiError::Serialization("missing field 'amount'".into()))?;
            let description = text_field(node, "description");
            if kind == EntryKind::Donation {
                EntryPayload::Donation {
                    target,
                    amount,
                    description,
                }
            } else {
                EntryPayload::Transaction {
                    target,
                    amount,
                    description,
                }
            }
        }
        EntryKind::News => EntryPayload::News {
            title: text_field(node, "title"),
            description: text_field(node, "description"),
        },
        EntryKind::Post => EntryPayload::Post {
            title: text_field(node, "title"),
            description: text_field(node, "description"),
        },
        EntryKind::Event => {
            let rsvps = match node.get("rsvp") {
                Some(Value::Array(items)) => items.iter().filter_map(|v| parse_bid(v).ok()).collect(),
                _ => Vec::new(),
            };
            EntryPayload::Event {
                title: text_field(node, "title"),
                description: text_field(node, "description"),
                date: timestamp_field(node, "date")?,
                duration: node
                    .get("duration")
                    .and_then(Value::as_u64)
                    .and_then(|d| u32::try_from(d).ok())
                    .unwrap_or_default(),
                address: text_field(node, "address"),
                rsvps,
            }
        }
        EntryKind::Comment => EntryPayload::Comment {
            parent: ref_field(node, "parent")?,
            description: text_field(node, "description"),
        },
    };

    Ok(Entry {
        bid,
        created,
        author,
        payload,
    })
}

/// Decodes a list of entry nodes, skipping the ones that cannot be decoded.
pub(crate) fn parse_entries(list: &Value) -> Vec<Entry> {
    let Some(items) = list.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|node| match parse_entry(node) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, node = %node, "Skipping undecodable entry");
                None
            }
        })
        .collect()
}

pub(crate) fn parse_user(node: &Value) -> ApiResult<User> {
    let bid = parse_bid(node)?;
    if !bid.is_user() {
        return Err(ApiError::Serialization(format!("{bid} is not a user")));
    }
    Ok(User {
        bid,
        username: text_field(node, "username"),
        full_name: text_field(node, "name"),
        balance: Cents(node.get("balance").and_then(Value::as_i64).unwrap_or_default()),
    })
}

pub(crate) fn parse_users(list: &Value) -> Vec<User> {
    let Some(items) = list.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|node| match parse_user(node) {
            Ok(user) => Some(user),
            Err(e) => {
                warn!(error = %e, "Skipping undecodable user");
                None
            }
        })
        .collect()
}

/// Finds the first `{__typename, id}` object anywhere in `value`.
pub(crate) fn find_bid(value: &Value) -> Option<Bid> {
    match value {
        Value::Object(map) => {
            if map.contains_key("__typename") && map.contains_key("id") {
                return parse_bid(value).ok();
            }
            map.values().find_map(find_bid)
        }
        Value::Array(items) => items.iter().find_map(find_bid),
        _ => None,
    }
}
