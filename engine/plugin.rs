//! Ordered hook chains a host application can register to observe or rewrite queries,
//! driver-level SQL, procedure calls, and entity mutations (§4.8).
//!
//! A plugin registered later wraps one registered earlier: calling `on_driver_query`
//! folds the chain outside-in so the last-registered plugin sees the SQL first and the
//! first-registered plugin sees it last, mirroring how middleware stacks compose.

use qorm_schema::ModelName;
use serde_json::Value;

/// One entity mutation as seen by an `onEntityMutation` hook, after planning but before
/// (or after, depending on `when`) it reaches the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationWhen {
    Before,
    After,
}

pub trait Plugin: Send + Sync {
    /// Rewrites the logical operation arguments before validation/planning. The default
    /// passes them through unchanged.
    fn on_query(&self, _model_name: &ModelName, args: Value) -> Value {
        args
    }

    /// Rewrites the literal SQL text about to be sent to the driver.
    fn on_driver_query(&self, _model_name: &ModelName, sql: String) -> String {
        sql
    }

    /// Observes (and may veto, by returning `Err`) a procedure invocation.
    fn on_procedure(&self, _name: &str, args: Value) -> Result<Value, String> {
        Ok(args)
    }

    /// Observes an entity mutation either before it runs (where it may still be
    /// cancelled by returning `Err`) or after it commits, per `when`.
    fn on_entity_mutation(&self, _model_name: &ModelName, _kind: MutationKind, _when: MutationWhen, row: Value) -> Result<Value, String> {
        Ok(row)
    }
}

/// The full set of plugins registered on a client, in registration order. `$use` appends;
/// `$unuse` removes by name; `$unuseAll` clears the chain (§4.9).
#[derive(Default)]
pub struct PluginChain {
    plugins: Vec<(String, std::sync::Arc<dyn Plugin>)>,
}

impl PluginChain {
    pub fn new() -> Self {
        Self { plugins: Vec::new() }
    }

    /// Shallow-copies the registration list (each plugin itself is an `Arc`, so this is
    /// cheap) for callers that need to mutate a fresh chain without disturbing the one
    /// in-flight executors already hold a reference to.
    pub fn clone_chain(&self) -> Self {
        Self { plugins: self.plugins.clone() }
    }

    pub fn use_plugin(&mut self, name: impl Into<String>, plugin: std::sync::Arc<dyn Plugin>) {
        self.plugins.push((name.into(), plugin));
    }

    pub fn unuse(&mut self, name: &str) -> bool {
        let before = self.plugins.len();
        self.plugins.retain(|(n, _)| n != name);
        self.plugins.len() != before
    }

    pub fn unuse_all(&mut self) {
        self.plugins.clear();
    }

    pub fn on_query(&self, model_name: &ModelName, args: Value) -> Value {
        self.plugins.iter().rev().fold(args, |acc, (_, p)| p.on_query(model_name, acc))
    }

    pub fn on_driver_query(&self, model_name: &ModelName, sql: &str) -> String {
        self.plugins
            .iter()
            .rev()
            .fold(sql.to_owned(), |acc, (_, p)| p.on_driver_query(model_name, acc))
    }

    pub fn on_procedure(&self, name: &str, args: Value) -> Result<Value, String> {
        let mut acc = args;
        for (_, p) in self.plugins.iter().rev() {
            acc = p.on_procedure(name, acc)?;
        }
        Ok(acc)
    }

    pub fn on_entity_mutation(&self, model_name: &ModelName, kind: MutationKind, when: MutationWhen, row: Value) -> Result<Value, String> {
        let mut acc = row;
        for (_, p) in self.plugins.iter().rev() {
            acc = p.on_entity_mutation(model_name, kind, when, acc)?;
        }
        Ok(acc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Uppercase;
    impl Plugin for Uppercase {
        fn on_driver_query(&self, _model_name: &ModelName, sql: String) -> String {
            sql.to_uppercase()
        }
    }

    struct Exclaim;
    impl Plugin for Exclaim {
        fn on_driver_query(&self, _model_name: &ModelName, sql: String) -> String {
            format!("{sql}!")
        }
    }

    #[test]
    fn last_registered_wraps_earlier_plugins() {
        let mut chain = PluginChain::new();
        chain.use_plugin("upper", std::sync::Arc::new(Uppercase));
        chain.use_plugin("exclaim", std::sync::Arc::new(Exclaim));
        let model = ModelName::from("User");
        // exclaim was registered last, so it sees the raw SQL first: "select" -> "select!" -> "SELECT!"
        assert_eq!(chain.on_driver_query(&model, "select"), "SELECT!");
    }

    #[test]
    fn unuse_removes_a_plugin_by_name() {
        let mut chain = PluginChain::new();
        chain.use_plugin("upper", std::sync::Arc::new(Uppercase));
        assert!(chain.unuse("upper"));
        let model = ModelName::from("User");
        assert_eq!(chain.on_driver_query(&model, "select"), "select");
    }
}
