use graphql_parser::query::{
    Definition, Document, Field, FragmentDefinition, Mutation, OperationDefinition, Query,
    Selection, SelectionSet, Value, VariableDefinition, parse_query,
};
use serde_json::{Map, Value as JsonValue, json};
use std::collections::{BTreeSet, HashSet};

use crate::{GatewayError, GraphQLRequest, LocalContext, OperationKind, TransformError};

pub type QueryDocument = Document<'static, String>;
pub type QueryField = Field<'static, String>;
type QuerySelectionSet = SelectionSet<'static, String>;
type QueryOperation = OperationDefinition<'static, String>;
type QueryFragment = FragmentDefinition<'static, String>;
type QueryVariableDefinition = VariableDefinition<'static, String>;

/// A client request parsed once per stitch call and shared by every root
/// field resolver that needs to build a delegated query.
#[derive(Debug, Clone)]
pub struct ClientOperation {
    document: QueryDocument,
    operation_name: Option<String>,
    variables: Map<String, JsonValue>,
    local_context: LocalContext,
}

impl ClientOperation {
    pub fn parse(request: &GraphQLRequest) -> Result<Self, GatewayError> {
        let document = parse_query::<String>(&request.query)
            .map_err(|e| GatewayError::Parse(e.to_string()))?
            .into_static();

        Ok(ClientOperation {
            document,
            operation_name: request.operation_name.clone(),
            variables: request.variables_map(),
            local_context: request.local_context.clone(),
        })
    }

    pub fn document(&self) -> &QueryDocument {
        &self.document
    }

    pub fn variables(&self) -> &Map<String, JsonValue> {
        &self.variables
    }

    pub fn local_context(&self) -> &LocalContext {
        &self.local_context
    }

    /// The operation selected by the request's operation name.
    pub fn operation(&self) -> Result<&QueryOperation, TransformError> {
        let mut operations = self
            .document
            .definitions
            .iter()
            .filter_map(|definition| match definition {
                Definition::Operation(operation) => Some(operation),
                Definition::Fragment(_) => None,
            });

        match &self.operation_name {
            Some(name) => operations
                .find(|operation| OperationParts::of(operation).name == Some(name))
                .ok_or_else(|| TransformError::OperationNotFound(name.clone())),
            None => {
                let first = operations.next().ok_or(TransformError::NoOperation)?;
                if operations.next().is_some() {
                    return Err(TransformError::AmbiguousOperation);
                }
                Ok(first)
            }
        }
    }

    pub fn kind(&self) -> Result<OperationKind, TransformError> {
        Ok(OperationParts::of(self.operation()?).kind)
    }

    pub fn fragment(&self, name: &str) -> Option<&QueryFragment> {
        self.document
            .definitions
            .iter()
            .find_map(|definition| match definition {
                Definition::Fragment(fragment) if fragment.name == name => Some(fragment),
                _ => None,
            })
    }

    /// Every field selected at the root of the operation, looking through
    /// inline fragments and fragment spreads.
    pub fn root_fields(&self) -> Result<Vec<&QueryField>, TransformError> {
        let parts = OperationParts::of(self.operation()?);
        let mut fields = Vec::new();
        let mut visited = HashSet::new();
        self.collect_root_fields(parts.selection_set, None, &mut fields, &mut visited)?;
        Ok(fields)
    }

    fn collect_root_fields<'d>(
        &'d self,
        selection_set: &'d QuerySelectionSet,
        response_key: Option<&str>,
        fields: &mut Vec<&'d QueryField>,
        visited: &mut HashSet<&'d str>,
    ) -> Result<(), TransformError> {
        for selection in &selection_set.items {
            match selection {
                Selection::Field(field) => {
                    let key = field.alias.as_deref().unwrap_or(field.name.as_str());
                    if response_key.is_none_or(|wanted| wanted == key) {
                        fields.push(field);
                    }
                }
                Selection::InlineFragment(fragment) => {
                    self.collect_root_fields(&fragment.selection_set, response_key, fields, visited)?
                }
                Selection::FragmentSpread(spread) => {
                    if visited.insert(spread.fragment_name.as_str()) {
                        let fragment = self
                            .fragment(&spread.fragment_name)
                            .ok_or_else(|| TransformError::UnknownFragment(spread.fragment_name.clone()))?;
                        self.collect_root_fields(&fragment.selection_set, response_key, fields, visited)?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// The parts shared by every operation shape, shorthand `{ ... }` included.
struct OperationParts<'o> {
    kind: OperationKind,
    name: Option<&'o String>,
    variable_definitions: &'o [QueryVariableDefinition],
    selection_set: &'o QuerySelectionSet,
}

impl<'o> OperationParts<'o> {
    fn of(operation: &'o QueryOperation) -> Self {
        match operation {
            OperationDefinition::SelectionSet(selection_set) => OperationParts {
                kind: OperationKind::Query,
                name: None,
                variable_definitions: &[],
                selection_set,
            },
            OperationDefinition::Query(query) => OperationParts {
                kind: OperationKind::Query,
                name: query.name.as_ref(),
                variable_definitions: &query.variable_definitions,
                selection_set: &query.selection_set,
            },
            OperationDefinition::Mutation(mutation) => OperationParts {
                kind: OperationKind::Mutation,
                name: mutation.name.as_ref(),
                variable_definitions: &mutation.variable_definitions,
                selection_set: &mutation.selection_set,
            },
            OperationDefinition::Subscription(subscription) => OperationParts {
                kind: OperationKind::Subscription,
                name: subscription.name.as_ref(),
                variable_definitions: &subscription.variable_definitions,
                selection_set: &subscription.selection_set,
            },
        }
    }
}

/// The self-contained query sent to one source to resolve one root field.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphQLQuery {
    kind: OperationKind,
    field: QueryField,
    variables: Map<String, JsonValue>,
    query: String,
}

impl GraphQLQuery {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn field(&self) -> &QueryField {
        &self.field
    }

    pub fn field_name(&self) -> &str {
        &self.field.name
    }

    pub fn variables(&self) -> &Map<String, JsonValue> {
        &self.variables
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// The standard `{query, variables}` request body.
    pub fn to_request_body(&self) -> JsonValue {
        json!({
            "query": self.query,
            "variables": self.variables,
        })
    }
}

/// Builds delegated queries out of client operations.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueryTransformer;

impl QueryTransformer {
    pub fn new() -> Self {
        QueryTransformer
    }

    /// Extracts the smallest operation that resolves the root field selected
    /// under `response_key`.
    pub fn transform(
        &self,
        operation: &ClientOperation,
        response_key: &str,
    ) -> Result<GraphQLQuery, TransformError> {
        let parts = OperationParts::of(operation.operation()?);
        if parts.kind == OperationKind::Subscription {
            return Err(TransformError::UnsupportedOperation(parts.kind));
        }

        let mut field = self.merged_root_field(operation, parts.selection_set, response_key)?;

        let mut usage = Usage::default();
        usage.collect_field(&field);
        self.collect_fragment_usage(operation, &mut usage)?;

        strip_aliases(&mut field);
        add_typenames(&mut field);

        let fragments: Vec<QueryFragment> = operation
            .document
            .definitions
            .iter()
            .filter_map(|definition| match definition {
                Definition::Fragment(fragment) if usage.fragments.contains(&fragment.name) => {
                    let mut fragment = fragment.clone();
                    strip_selection_set_aliases(&mut fragment.selection_set);
                    add_selection_set_typenames(&mut fragment.selection_set);
                    Some(fragment)
                }
                _ => None,
            })
            .collect();

        let variable_definitions: Vec<QueryVariableDefinition> = parts
            .variable_definitions
            .iter()
            .filter(|definition| usage.variables.contains(&definition.name))
            .cloned()
            .collect();

        let variables: Map<String, JsonValue> = operation
            .variables
            .iter()
            .filter(|(name, _)| usage.variables.contains(*name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        let selection_set = SelectionSet {
            span: (field.position, field.position),
            items: vec![Selection::Field(field.clone())],
        };
        let delegated = match parts.kind {
            OperationKind::Mutation => OperationDefinition::Mutation(Mutation {
                position: field.position,
                name: None,
                variable_definitions,
                directives: Vec::new(),
                selection_set,
            }),
            _ => OperationDefinition::Query(Query {
                position: field.position,
                name: None,
                variable_definitions,
                directives: Vec::new(),
                selection_set,
            }),
        };

        let mut definitions = vec![Definition::Operation(delegated)];
        definitions.extend(fragments.into_iter().map(Definition::Fragment));
        let query = Document { definitions }.to_string();

        Ok(GraphQLQuery {
            kind: parts.kind,
            field,
            variables,
            query,
        })
    }

    /// Root selections sharing one response key are merged into the first.
    fn merged_root_field(
        &self,
        operation: &ClientOperation,
        selection_set: &QuerySelectionSet,
        response_key: &str,
    ) -> Result<QueryField, TransformError> {
        let mut matches = Vec::new();
        let mut visited = HashSet::new();
        operation.collect_root_fields(selection_set, Some(response_key), &mut matches, &mut visited)?;

        let mut matches = matches.into_iter();
        let mut field = matches
            .next()
            .cloned()
            .ok_or_else(|| TransformError::FieldNotFound(response_key.to_string()))?;
        for other in matches {
            field
                .selection_set
                .items
                .extend(other.selection_set.items.iter().cloned());
        }
        Ok(field)
    }

    /// Follows fragment spreads to a fixpoint, picking up the variables used
    /// inside every reachable fragment.
    fn collect_fragment_usage(
        &self,
        operation: &ClientOperation,
        usage: &mut Usage,
    ) -> Result<(), TransformError> {
        let mut pending: Vec<String> = usage.fragments.iter().cloned().collect();
        while let Some(name) = pending.pop() {
            let fragment = operation
                .fragment(&name)
                .ok_or_else(|| TransformError::UnknownFragment(name.clone()))?;

            let mut nested = Usage::default();
            nested.collect_directives(&fragment.directives);
            nested.collect_selection_set(&fragment.selection_set);

            usage.variables.extend(nested.variables);
            for spread in nested.fragments {
                if usage.fragments.insert(spread.clone()) {
                    pending.push(spread);
                }
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct Usage {
    variables: BTreeSet<String>,
    fragments: BTreeSet<String>,
}

impl Usage {
    fn collect_field(&mut self, field: &QueryField) {
        for (_, value) in &field.arguments {
            self.collect_value(value);
        }
        self.collect_directives(&field.directives);
        self.collect_selection_set(&field.selection_set);
    }

    fn collect_selection_set(&mut self, selection_set: &QuerySelectionSet) {
        for selection in &selection_set.items {
            match selection {
                Selection::Field(field) => self.collect_field(field),
                Selection::FragmentSpread(spread) => {
                    self.fragments.insert(spread.fragment_name.clone());
                    self.collect_directives(&spread.directives);
                }
                Selection::InlineFragment(fragment) => {
                    self.collect_directives(&fragment.directives);
                    self.collect_selection_set(&fragment.selection_set);
                }
            }
        }
    }

    fn collect_directives(&mut self, directives: &[graphql_parser::query::Directive<'static, String>]) {
        for directive in directives {
            for (_, value) in &directive.arguments {
                self.collect_value(value);
            }
        }
    }

    fn collect_value(&mut self, value: &Value<'static, String>) {
        match value {
            Value::Variable(name) => {
                self.variables.insert(name.clone());
            }
            Value::List(items) => items.iter().for_each(|item| self.collect_value(item)),
            Value::Object(fields) => fields.values().for_each(|item| self.collect_value(item)),
            _ => {}
        }
    }
}

fn strip_aliases(field: &mut QueryField) {
    field.alias = None;
    strip_selection_set_aliases(&mut field.selection_set);
}

fn strip_selection_set_aliases(selection_set: &mut QuerySelectionSet) {
    for selection in &mut selection_set.items {
        match selection {
            Selection::Field(field) => strip_aliases(field),
            Selection::InlineFragment(fragment) => {
                strip_selection_set_aliases(&mut fragment.selection_set)
            }
            Selection::FragmentSpread(_) => {}
        }
    }
}

/// Composite selections also ask for `__typename` so values of abstract
/// types can be matched to their concrete object type.
fn add_typenames(field: &mut QueryField) {
    if field.selection_set.items.is_empty() {
        return;
    }
    add_selection_set_typenames(&mut field.selection_set);

    let selected = field.selection_set.items.iter().any(|selection| {
        matches!(selection, Selection::Field(f) if f.name == "__typename" && f.alias.is_none())
    });
    if !selected {
        let position = field.selection_set.span.1;
        field.selection_set.items.push(Selection::Field(Field {
            position,
            alias: None,
            name: "__typename".to_string(),
            arguments: Vec::new(),
            directives: Vec::new(),
            selection_set: SelectionSet {
                span: (position, position),
                items: Vec::new(),
            },
        }));
    }
}

fn add_selection_set_typenames(selection_set: &mut QuerySelectionSet) {
    for selection in &mut selection_set.items {
        match selection {
            Selection::Field(field) => add_typenames(field),
            Selection::InlineFragment(fragment) => {
                add_selection_set_typenames(&mut fragment.selection_set)
            }
            Selection::FragmentSpread(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn operation(query: &str, variables: JsonValue) -> ClientOperation {
        ClientOperation::parse(&GraphQLRequest::new(query).variables(variables)).unwrap()
    }

    fn normalized(query: &str) -> String {
        query.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn leaf_field_becomes_a_one_field_query() {
        let op = operation("{ greeting1 greeting2 }", json!({}));
        let delegated = QueryTransformer::new().transform(&op, "greeting1").unwrap();

        assert_eq!(delegated.kind(), OperationKind::Query);
        assert_eq!(delegated.field_name(), "greeting1");
        assert_eq!(normalized(delegated.query()), "query { greeting1 }");
        assert!(delegated.variables().is_empty());
    }

    #[test]
    fn aliases_are_stripped_everywhere() {
        let op = operation(
            r#"
            query { g1: greeting1 me: user(id: 1) { fullName: name ...Extra } }
            fragment Extra on User { mail: email }
            "#,
            json!({}),
        );
        let transformer = QueryTransformer::new();

        let greeting = transformer.transform(&op, "g1").unwrap();
        assert_eq!(normalized(greeting.query()), "query { greeting1 }");

        let user = transformer.transform(&op, "me").unwrap();
        let text = normalized(user.query());
        assert!(!text.contains("fullName") && !text.contains("mail:") && !text.contains("me:"), "{text}");
        assert!(text.contains("fragment Extra on User { email }"), "{text}");
    }

    #[test]
    fn keeps_only_referenced_variables_and_fragments() {
        let op = operation(
            r#"
            query Dashboard($id: ID!, $limit: Int, $unused: String, $flag: Boolean!) {
              user(id: $id) {
                ...UserParts
                posts @include(if: $flag) { title }
              }
              other(arg: $unused) { id }
            }
            fragment UserParts on User { name ...Deeper }
            fragment Deeper on User { friends(first: $limit) { name } }
            fragment Unrelated on User { id }
            "#,
            json!({"id": "7", "limit": 3, "unused": "x", "flag": true}),
        );

        let delegated = QueryTransformer::new().transform(&op, "user").unwrap();
        let text = normalized(delegated.query());

        assert!(text.starts_with("query($id: ID!, $limit: Int, $flag: Boolean!)"), "{text}");
        assert!(text.contains("fragment UserParts on User"));
        assert!(text.contains("fragment Deeper on User"));
        assert!(!text.contains("Unrelated"));
        assert!(!text.contains("$unused"));
        assert_eq!(
            JsonValue::Object(delegated.variables().clone()),
            json!({"id": "7", "limit": 3, "flag": true})
        );
    }

    #[test]
    fn mutations_keep_their_operation_kind() {
        let op = operation(
            r#"mutation Create($input: CreateUserInput!) { createUser(input: $input) { id } }"#,
            json!({"input": {"name": "Alice"}}),
        );
        let delegated = QueryTransformer::new().transform(&op, "createUser").unwrap();

        assert_eq!(delegated.kind(), OperationKind::Mutation);
        assert!(normalized(delegated.query()).starts_with("mutation($input: CreateUserInput!)"));
        assert_eq!(delegated.to_request_body()["variables"]["input"]["name"], "Alice");
    }

    #[test]
    fn subscriptions_are_rejected() {
        let op = operation("subscription { ticks }", json!({}));
        let error = QueryTransformer::new().transform(&op, "ticks").unwrap_err();
        assert_eq!(error, TransformError::UnsupportedOperation(OperationKind::Subscription));
    }

    #[test]
    fn finds_root_fields_behind_fragments_and_merges_repeats() {
        let op = operation(
            r#"
            query { ... on Query { user { id } } ...Root }
            fragment Root on Query { user { name } }
            "#,
            json!({}),
        );
        let delegated = QueryTransformer::new().transform(&op, "user").unwrap();
        assert_eq!(normalized(delegated.query()), "query { user { id name __typename } }");
    }

    #[test]
    fn composite_selections_request_their_typename() {
        let op = operation(
            r#"
            { pets { ... on Dog { barks owner { name } } ...CatParts } }
            fragment CatParts on Cat { lives friend { __typename name } }
            "#,
            json!({}),
        );
        let delegated = QueryTransformer::new().transform(&op, "pets").unwrap();

        assert_eq!(
            normalized(delegated.query()),
            "query { pets { ... on Dog { barks owner { name __typename } } ...CatParts __typename } } \
             fragment CatParts on Cat { lives friend { __typename name } }"
        );
    }

    #[test]
    fn selects_operation_by_name() {
        let request = GraphQLRequest::new("query A { a } query B { b }").operation_name("B");
        let op = ClientOperation::parse(&request).unwrap();
        assert_eq!(op.root_fields().unwrap()[0].name, "b");

        let ambiguous = ClientOperation::parse(&GraphQLRequest::new("query A { a } query B { b }")).unwrap();
        assert_eq!(ambiguous.operation().unwrap_err(), TransformError::AmbiguousOperation);
    }

    #[test]
    fn missing_field_is_reported() {
        let op = operation("{ a }", json!({}));
        let error = QueryTransformer::new().transform(&op, "b").unwrap_err();
        assert_eq!(error, TransformError::FieldNotFound("b".to_string()));
    }
}
