//! Turns a merged registry into an executable `async_graphql::dynamic::Schema`.
//!
//! Root fields of the query and mutation types delegate to the source bound to
//! them. Every other field projects its value out of the JSON its parent
//! received from a source.

use async_graphql::dynamic::{
    Enum, EnumItem, Field, FieldFuture, FieldValue, InputObject, InputValue, Interface,
    InterfaceField, Object, ResolverContext, Scalar, Schema, TypeRef, Union,
};
use async_graphql::{Name, Value as ConstValue};
use graphql_parser::schema::{Directive, Type, TypeDefinition, Value};
use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::error::SourceFetchError;
use crate::query_transformer::{ClientOperation, QueryTransformer};
use crate::schema_merger::MergedSchema;
use crate::schema_source::SchemaSource;
use crate::type_registry::{SchemaField, TypeRegistry};
use crate::{GatewayError, OperationKind, SourceError};

type FieldType = Type<'static, String>;

/// The combined schema of every loaded source, ready to execute requests.
pub struct CombinedSchema {
    registry: TypeRegistry,
    bindings: IndexMap<(OperationKind, String), Arc<SchemaSource>>,
    executable: Schema,
}

impl CombinedSchema {
    pub fn build(merged: MergedSchema, delegation_timeout: Option<Duration>) -> Result<Self, GatewayError> {
        let MergedSchema {
            registry,
            bindings,
            scalars,
        } = merged;

        let query_type = registry
            .root_type_name(OperationKind::Query)
            .ok_or_else(|| GatewayError::SchemaBuild("no source declares a query type".to_string()))?;
        let mutation_type = registry.root_type_name(OperationKind::Mutation);
        let subscription_type = registry.root_type_name(OperationKind::Subscription);

        let index = Arc::new(TypeIndex::new(&registry));
        let mut builder = Schema::build(query_type, mutation_type, None);

        for scalar in &scalars {
            builder = builder.register(Scalar::new(scalar.as_str()));
        }

        for definition in registry.types() {
            builder = match definition {
                TypeDefinition::Scalar(_) => continue,
                TypeDefinition::Object(object) => {
                    if Some(object.name.as_str()) == subscription_type {
                        // Subscriptions are delegated as whole operations.
                        continue;
                    }
                    let root_kind = registry
                        .root_kind_of(&object.name)
                        .filter(|kind| *kind != OperationKind::Subscription);

                    let mut output = Object::new(object.name.as_str());
                    if let Some(description) = &object.description {
                        output = output.description(description.as_str());
                    }
                    for interface in &object.implements_interfaces {
                        output = output.implement(interface.as_str());
                    }
                    for field in &object.fields {
                        let resolver = match root_kind {
                            Some(kind) => match bindings.get(&(kind, field.name.clone())) {
                                Some(source) => Resolver::Delegate(Arc::new(Delegation {
                                    kind,
                                    source: Arc::clone(source),
                                    timeout: delegation_timeout,
                                })),
                                None => Resolver::Project,
                            },
                            None => Resolver::Project,
                        };
                        output = output.field(output_field(field, resolver, &index));
                    }
                    builder.register(output)
                }
                TypeDefinition::Interface(interface) => {
                    let mut output = Interface::new(interface.name.as_str());
                    if let Some(description) = &interface.description {
                        output = output.description(description.as_str());
                    }
                    for parent in &interface.implements_interfaces {
                        output = output.implement(parent.as_str());
                    }
                    for field in &interface.fields {
                        let mut interface_field =
                            InterfaceField::new(field.name.as_str(), type_ref(&field.field_type));
                        for argument in &field.arguments {
                            interface_field = interface_field.argument(input_value(argument));
                        }
                        output = output.field(interface_field);
                    }
                    builder.register(output)
                }
                TypeDefinition::Union(union) => {
                    let mut output = Union::new(union.name.as_str());
                    for member in &union.types {
                        output = output.possible_type(member.as_str());
                    }
                    builder.register(output)
                }
                TypeDefinition::Enum(enumeration) => {
                    let mut output = Enum::new(enumeration.name.as_str());
                    for value in &enumeration.values {
                        let mut item = EnumItem::new(value.name.as_str());
                        if let Some(description) = &value.description {
                            item = item.description(description.as_str());
                        }
                        if let Some(reason) = deprecation(&value.directives) {
                            item = item.deprecation(Some(reason.as_str()));
                        }
                        output = output.item(item);
                    }
                    builder.register(output)
                }
                TypeDefinition::InputObject(input) => {
                    let mut output = InputObject::new(input.name.as_str());
                    for field in &input.fields {
                        output = output.field(input_value(field));
                    }
                    builder.register(output)
                }
            };
        }

        let executable = builder
            .finish()
            .map_err(|e| GatewayError::SchemaBuild(e.to_string()))?;

        Ok(CombinedSchema {
            registry,
            bindings,
            executable,
        })
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn executable(&self) -> &Schema {
        &self.executable
    }

    pub fn binding(&self, kind: OperationKind, field: &str) -> Option<&Arc<SchemaSource>> {
        self.bindings.get(&(kind, field.to_string()))
    }

    pub fn sdl(&self) -> String {
        self.registry.to_sdl()
    }
}

/// Which output kind each named type has, and which objects implement each
/// interface.
#[derive(Debug, Default)]
struct TypeIndex {
    kinds: HashMap<String, OutputKind>,
    implementors: HashMap<String, Vec<(String, HashSet<String>)>>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum OutputKind {
    Object,
    Interface,
    Union,
    Enum,
    Leaf,
}

impl TypeIndex {
    fn new(registry: &TypeRegistry) -> Self {
        let mut index = TypeIndex::default();
        for definition in registry.types() {
            let (name, kind) = match definition {
                TypeDefinition::Scalar(t) => (&t.name, OutputKind::Leaf),
                TypeDefinition::Object(t) => {
                    let fields: HashSet<String> = t.fields.iter().map(|f| f.name.clone()).collect();
                    for interface in &t.implements_interfaces {
                        index
                            .implementors
                            .entry(interface.clone())
                            .or_default()
                            .push((t.name.clone(), fields.clone()));
                    }
                    (&t.name, OutputKind::Object)
                }
                TypeDefinition::Interface(t) => (&t.name, OutputKind::Interface),
                TypeDefinition::Union(t) => (&t.name, OutputKind::Union),
                TypeDefinition::Enum(t) => (&t.name, OutputKind::Enum),
                TypeDefinition::InputObject(t) => (&t.name, OutputKind::Leaf),
            };
            index.kinds.insert(name.clone(), kind);
        }
        index
    }

    fn kind(&self, name: &str) -> OutputKind {
        self.kinds.get(name).copied().unwrap_or(OutputKind::Leaf)
    }

    /// Concrete object type of a value of abstract type `name`.
    fn concrete_type(&self, name: &str, value: &JsonValue) -> async_graphql::Result<String> {
        if let Some(typename) = value.get("__typename").and_then(JsonValue::as_str) {
            return Ok(typename.to_string());
        }

        if self.kind(name) == OutputKind::Union {
            return Err("Please provide __typename for union types".into());
        }

        // Without a typename, only a value whose keys single out one
        // implementor is accepted.
        let keys: Vec<&String> = match value {
            JsonValue::Object(map) => map.keys().collect(),
            _ => Vec::new(),
        };
        let candidates: Vec<&String> = self
            .implementors
            .get(name)
            .map(|implementors| {
                implementors
                    .iter()
                    .filter(|(_, fields)| keys.iter().all(|key| fields.contains(*key)))
                    .map(|(object, _)| object)
                    .collect()
            })
            .unwrap_or_default();

        match candidates.as_slice() {
            [object] if !keys.is_empty() => Ok(object.to_string()),
            _ => Err(format!("Could not determine the concrete type of {name}, please provide __typename").into()),
        }
    }
}

enum Resolver {
    Delegate(Arc<Delegation>),
    Project,
}

/// A root field executed by one source.
struct Delegation {
    kind: OperationKind,
    source: Arc<SchemaSource>,
    timeout: Option<Duration>,
}

impl Delegation {
    #[instrument(skip_all, fields(source = %self.source.name(), kind = %self.kind, field = response_key))]
    async fn fetch(
        &self,
        operation: &ClientOperation,
        response_key: &str,
    ) -> async_graphql::Result<JsonValue> {
        let query = QueryTransformer::new().transform(operation, response_key)?;
        debug!(query = query.query(), "delegating root field");

        let execution = self.source.execute(&query, operation.local_context());
        let raw = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, execution)
                .await
                .map_err(|_| SourceError::Timeout(self.source.name().to_string()))??,
            None => execution.await?,
        };

        let response: JsonValue =
            serde_json::from_str(&raw).map_err(|e| SourceError::MalformedResponse {
                source_name: self.source.name().to_string(),
                message: e.to_string(),
            })?;

        if let Some(JsonValue::Array(errors)) = response.get("errors") {
            if !errors.is_empty() {
                return Err(SourceFetchError {
                    source_name: self.source.name().to_string(),
                    errors: errors.clone(),
                }
                .into());
            }
        }

        match response.get("data") {
            Some(JsonValue::Object(data)) => Ok(data
                .get(query.field_name())
                .cloned()
                .unwrap_or(JsonValue::Null)),
            Some(JsonValue::Null) => Ok(JsonValue::Null),
            _ => Err(SourceError::MalformedResponse {
                source_name: self.source.name().to_string(),
                message: "response has no data section".to_string(),
            }
            .into()),
        }
    }
}

fn output_field(field: &SchemaField, resolver: Resolver, index: &Arc<TypeIndex>) -> Field {
    let field_type = Arc::new(field.field_type.clone());
    let index = Arc::clone(index);
    let delegation = match resolver {
        Resolver::Delegate(delegation) => Some(delegation),
        Resolver::Project => None,
    };

    let mut output = Field::new(field.name.as_str(), type_ref(&field.field_type), move |ctx| {
        let field_type = Arc::clone(&field_type);
        let index = Arc::clone(&index);
        let delegation = delegation.clone();
        FieldFuture::new(async move {
            match resolve_value(&ctx, &field_type, &index, delegation).await {
                Ok(value) => Ok(value),
                // Non-null fields bubble the error up to the nearest nullable parent.
                Err(error) if matches!(*field_type, Type::NonNullType(_)) => Err(error),
                Err(error) => {
                    ctx.add_error(ctx.set_error_path(error.into_server_error(ctx.item.pos)));
                    Ok(None)
                }
            }
        })
    });

    if let Some(description) = &field.description {
        output = output.description(description.as_str());
    }
    if let Some(reason) = deprecation(&field.directives) {
        output = output.deprecation(Some(reason.as_str()));
    }
    for argument in &field.arguments {
        output = output.argument(input_value(argument));
    }
    output
}

async fn resolve_value<'a>(
    ctx: &ResolverContext<'a>,
    field_type: &FieldType,
    index: &TypeIndex,
    delegation: Option<Arc<Delegation>>,
) -> async_graphql::Result<Option<FieldValue<'a>>> {
    // Root types can also appear nested, in which case the parent already
    // carries the value.
    let value = match (ctx.parent_value.try_downcast_ref::<JsonValue>(), delegation) {
        (Ok(parent), _) => project(parent, ctx),
        (Err(_), Some(delegation)) => {
            let operation = ctx.data::<Arc<ClientOperation>>()?;
            let response_key = ctx.field().alias().unwrap_or_else(|| ctx.field().name());
            delegation.fetch(operation, response_key).await?
        }
        (Err(_), None) => JsonValue::Null,
    };
    to_field_value(value, field_type, index)
}

/// Sources answer with unaliased field names.
fn project(parent: &JsonValue, ctx: &ResolverContext<'_>) -> JsonValue {
    parent
        .get(ctx.field().name())
        .cloned()
        .unwrap_or(JsonValue::Null)
}

fn to_field_value<'a>(
    value: JsonValue,
    field_type: &FieldType,
    index: &TypeIndex,
) -> async_graphql::Result<Option<FieldValue<'a>>> {
    if value.is_null() {
        return Ok(None);
    }

    match field_type {
        Type::NonNullType(inner) => to_field_value(value, inner, index),
        Type::ListType(inner) => {
            let JsonValue::Array(items) = value else {
                return Err(format!("expected a list, got {value}").into());
            };
            let items = items
                .into_iter()
                .map(|item| {
                    to_field_value(item, inner, index)
                        .map(|item| item.unwrap_or_else(|| FieldValue::value(ConstValue::Null)))
                })
                .collect::<async_graphql::Result<Vec<_>>>()?;
            Ok(Some(FieldValue::list(items)))
        }
        Type::NamedType(name) => match index.kind(name) {
            OutputKind::Object => Ok(Some(FieldValue::owned_any(value))),
            OutputKind::Interface | OutputKind::Union => {
                let concrete = index.concrete_type(name, &value)?;
                Ok(Some(FieldValue::owned_any(value).with_type(concrete)))
            }
            OutputKind::Enum => match value {
                JsonValue::String(item) => Ok(Some(FieldValue::value(ConstValue::Enum(Name::new(item))))),
                other => Ok(Some(FieldValue::value(ConstValue::from_json(other)?))),
            },
            OutputKind::Leaf => Ok(Some(FieldValue::value(ConstValue::from_json(value)?))),
        },
    }
}

fn type_ref(field_type: &FieldType) -> TypeRef {
    match field_type {
        Type::NamedType(name) => TypeRef::named(name.as_str()),
        Type::ListType(inner) => TypeRef::List(Box::new(type_ref(inner))),
        Type::NonNullType(inner) => TypeRef::NonNull(Box::new(type_ref(inner))),
    }
}

fn input_value(argument: &graphql_parser::schema::InputValue<'static, String>) -> InputValue {
    let mut input = InputValue::new(argument.name.as_str(), type_ref(&argument.value_type));
    if let Some(description) = &argument.description {
        input = input.description(description.as_str());
    }
    if let Some(default) = &argument.default_value {
        input = input.default_value(const_value(default));
    }
    input
}

fn const_value(value: &Value<'static, String>) -> ConstValue {
    match value {
        Value::Variable(_) | Value::Null => ConstValue::Null,
        Value::Int(number) => number
            .as_i64()
            .map(|n| ConstValue::Number(n.into()))
            .unwrap_or(ConstValue::Null),
        Value::Float(number) => serde_json::Number::from_f64(*number)
            .map(ConstValue::Number)
            .unwrap_or(ConstValue::Null),
        Value::String(text) => ConstValue::String(text.clone()),
        Value::Boolean(flag) => ConstValue::Boolean(*flag),
        Value::Enum(item) => ConstValue::Enum(Name::new(item)),
        Value::List(items) => ConstValue::List(items.iter().map(const_value).collect()),
        Value::Object(fields) => ConstValue::Object(
            fields
                .iter()
                .map(|(name, value)| (Name::new(name), const_value(value)))
                .collect(),
        ),
    }
}

fn deprecation(directives: &[Directive<'static, String>]) -> Option<String> {
    let directive = directives.iter().find(|d| d.name == "deprecated")?;
    let reason = directive
        .arguments
        .iter()
        .find(|(name, _)| name == "reason")
        .and_then(|(_, value)| match value {
            Value::String(reason) => Some(reason.clone()),
            _ => None,
        });
    Some(reason.unwrap_or_else(|| "No longer supported".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_transformer::GraphQLQuery;
    use crate::schema_merger::SchemaMerger;
    use crate::schema_source::QueryRetriever;
    use crate::{GraphQLRequest, LocalContext};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    /// Answers every delegated query with a fixed body.
    struct Fixed(JsonValue);

    #[async_trait]
    impl QueryRetriever for Fixed {
        async fn fetch(&self, _: &str, _: &GraphQLQuery, _: &LocalContext) -> Result<String, SourceError> {
            Ok(self.0.to_string())
        }
    }

    const PETS: &str = r#"
        scalar Date
        interface Pet { name: String }
        type Dog implements Pet { name: String barks: Boolean }
        type Cat implements Pet { name: String lives: Int born: Date }
        union Found = Dog | Cat
        enum Mood { HAPPY GRUMPY }
        type Query {
            pets: [Pet]
            found: [Found]
            mood: Mood
            legacy: String @deprecated(reason: "use mood")
        }
    "#;

    async fn schema_answering(body: JsonValue) -> CombinedSchema {
        let source = Arc::new(SchemaSource::defined("pets", PETS, Arc::new(Fixed(body))));
        source.load_schema("", &LocalContext::default()).await;
        let merged = SchemaMerger::new().merge(&[source.snapshot().unwrap()]).unwrap();
        CombinedSchema::build(merged, None).unwrap()
    }

    async fn run(schema: &CombinedSchema, query: &str) -> JsonValue {
        let operation = ClientOperation::parse(&GraphQLRequest::new(query)).unwrap();
        let request = async_graphql::Request::new(query).data(Arc::new(operation));
        serde_json::to_value(schema.executable().execute(request).await).unwrap()
    }

    #[tokio::test]
    async fn interfaces_resolve_by_typename_or_by_fields() {
        let schema = schema_answering(json!({
            "data": {"pets": [
                {"__typename": "Dog", "name": "Rex", "barks": true},
                {"name": "Tom", "lives": 9}
            ]}
        }))
        .await;

        let response = run(
            &schema,
            "{ pets { name ... on Dog { barks } ... on Cat { lives } } }",
        )
        .await;

        assert_eq!(
            response,
            json!({"data": {"pets": [
                {"name": "Rex", "barks": true},
                {"name": "Tom", "lives": 9}
            ]}})
        );
    }

    #[tokio::test]
    async fn unions_require_typename() {
        let schema = schema_answering(json!({"data": {"found": [{"name": "Rex"}]}})).await;

        let response = run(&schema, "{ found { ... on Dog { name } } }").await;

        assert_eq!(response["data"], json!({"found": null}));
        assert_eq!(
            response["errors"][0]["message"],
            "Please provide __typename for union types"
        );
        assert_eq!(response["errors"][0]["path"], json!(["found"]));
    }

    #[tokio::test]
    async fn interface_values_matching_several_types_are_rejected() {
        let schema = schema_answering(json!({"data": {"pets": [{"barks": true}, {}]}})).await;

        let response = run(&schema, "{ pets { ... on Dog { barks } } }").await;

        assert_eq!(response["data"], json!({"pets": null}));
        assert_eq!(response["errors"][0]["path"], json!(["pets"]));
        assert!(
            response["errors"][0]["message"]
                .as_str()
                .unwrap()
                .contains("concrete type of Pet")
        );
    }

    #[tokio::test]
    async fn failed_fields_are_null_and_keep_their_siblings() {
        let schema = schema_answering(json!({"errors": [{"message": "no pets today"}]})).await;

        let response = run(&schema, "{ pets { name } mood }").await;

        assert_eq!(response["data"], json!({"pets": null, "mood": null}));
        let mut paths: Vec<String> = response["errors"]
            .as_array()
            .unwrap()
            .iter()
            .map(|error| error["path"].to_string())
            .collect();
        paths.sort();
        assert_eq!(paths, vec![r#"["mood"]"#, r#"["pets"]"#]);
    }

    #[tokio::test]
    async fn enums_and_custom_scalars_pass_through() {
        let schema = schema_answering(json!({"data": {"mood": "GRUMPY"}})).await;
        assert_eq!(run(&schema, "{ mood }").await, json!({"data": {"mood": "GRUMPY"}}));
        assert_eq!(schema.registry().scalar_names().collect::<Vec<_>>(), vec!["Date"]);
    }

    #[tokio::test]
    async fn backend_errors_surface_as_field_errors() {
        let schema = schema_answering(json!({"errors": [{"message": "no pets today"}]})).await;

        let response = run(&schema, "{ pets { name } }").await;

        assert_eq!(response["data"], json!({"pets": null}));
        assert_eq!(response["errors"][0]["message"], "no pets today");
        assert_eq!(response["errors"][0]["path"], json!(["pets"]));
    }

    #[test]
    fn converts_default_values() {
        let value = graphql_parser::schema::parse_schema::<String>(
            r#"type Query { f(a: [Int] = [1, 2], b: Mood = HAPPY, c: In = {x: "y"}): Int }"#,
        )
        .unwrap()
        .into_static();
        let graphql_parser::schema::Definition::TypeDefinition(TypeDefinition::Object(query)) =
            &value.definitions[0]
        else {
            panic!("expected the query type");
        };
        let defaults: Vec<_> = query.fields[0]
            .arguments
            .iter()
            .map(|argument| const_value(argument.default_value.as_ref().unwrap()))
            .collect();
        assert_eq!(
            defaults,
            vec![
                async_graphql::value!([1, 2]),
                ConstValue::Enum(Name::new("HAPPY")),
                async_graphql::value!({"x": "y"}),
            ]
        );
    }
}
