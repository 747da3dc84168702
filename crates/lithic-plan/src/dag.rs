//! Append-only expression DAG
//!
//! An arena of nodes addressed by stable indices. Nodes are never mutated
//! after construction, only referenced or aliased; a handle is valid only
//! within the DAG that minted it. The DAG keeps a distinguished ordered
//! output index: the list of nodes currently considered the row's columns.

use crate::{Column, DataType, Schema, TypedValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DagError {
    #[error("column '{0}' not found in DAG output")]
    MissingColumn(String),

    #[error("input position {0} out of range ({1} inputs)")]
    InputOutOfRange(usize, usize),
}

/// Stable handle to a node within one DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(usize);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    /// A column of the DAG's input row.
    Input,
    Constant(TypedValue),
    /// Application of a resolved internal function.
    Function { function: String, args: Vec<NodeId> },
    /// A new name for an existing node, without recomputation.
    Alias { input: NodeId },
    /// Array explosion: one output row per element of the input array.
    Explode { input: NodeId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub kind: NodeKind,
    pub result_name: String,
    pub result_type: DataType,
}

/// The DAG plus its ordered output index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dag {
    nodes: Vec<Node>,
    inputs: Vec<NodeId>,
    output: Vec<NodeId>,
}

impl Dag {
    /// A DAG whose inputs (and initial outputs) are the given schema.
    pub fn from_schema(schema: &Schema) -> Self {
        let mut dag = Dag::default();
        for column in schema.iter() {
            dag.add_input(column.name.clone(), column.data_type.clone());
        }
        dag
    }

    pub fn add_input(&mut self, name: String, data_type: DataType) -> NodeId {
        let id = self.push(Node {
            kind: NodeKind::Input,
            result_name: name,
            result_type: data_type,
        });
        self.inputs.push(id);
        self.output.push(id);
        id
    }

    pub fn add_constant(&mut self, value: TypedValue, name: String) -> NodeId {
        self.push(Node {
            kind: NodeKind::Constant(value.clone()),
            result_name: name,
            result_type: value.data_type,
        })
    }

    pub fn add_function(
        &mut self,
        function: impl Into<String>,
        args: Vec<NodeId>,
        result_type: DataType,
        result_name: String,
    ) -> NodeId {
        self.push(Node {
            kind: NodeKind::Function { function: function.into(), args },
            result_name,
            result_type,
        })
    }

    pub fn add_alias(&mut self, input: NodeId, name: String) -> NodeId {
        let result_type = self.node(input).result_type.clone();
        self.push(Node {
            kind: NodeKind::Alias { input },
            result_name: name,
            result_type,
        })
    }

    pub fn add_explode(&mut self, input: NodeId, result_type: DataType, name: String) -> NodeId {
        self.push(Node {
            kind: NodeKind::Explode { input },
            result_name: name,
            result_type,
        })
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn input_at(&self, position: usize) -> Result<NodeId, DagError> {
        self.inputs
            .get(position)
            .copied()
            .ok_or(DagError::InputOutOfRange(position, self.inputs.len()))
    }

    /// The node currently published under `name`, if any. When two output
    /// nodes share a name the most recently published one wins.
    pub fn find_in_output(&self, name: &str) -> Option<NodeId> {
        self.output
            .iter()
            .rev()
            .copied()
            .find(|id| self.node(*id).result_name == name)
    }

    /// Publishes `id` in the output index, replacing any node of the same
    /// result name.
    pub fn add_or_replace_output(&mut self, id: NodeId) {
        let name = self.node(id).result_name.clone();
        if let Some(slot) = self
            .output
            .iter()
            .position(|o| self.node(*o).result_name == name)
        {
            self.output[slot] = id;
        } else {
            self.output.push(id);
        }
    }

    pub fn remove_from_output(&mut self, name: &str) {
        let Some(slot) = self
            .output
            .iter()
            .position(|o| self.node(*o).result_name == name)
        else {
            return;
        };
        self.output.remove(slot);
    }

    pub fn output(&self) -> &[NodeId] {
        &self.output
    }

    /// Restricts the output index to `(source, alias)` pairs, in order,
    /// inserting alias nodes where the published name changes.
    pub fn project(&mut self, aliases: &[(String, String)]) -> Result<(), DagError> {
        let mut new_output = Vec::with_capacity(aliases.len());
        for (source, alias) in aliases {
            let id = self
                .find_in_output(source)
                .ok_or_else(|| DagError::MissingColumn(source.clone()))?;
            let id = if alias == source {
                id
            } else {
                self.add_alias(id, alias.clone())
            };
            new_output.push(id);
        }
        self.output = new_output;
        Ok(())
    }

    /// Schema of the current output index.
    pub fn output_schema(&self) -> Schema {
        self.output
            .iter()
            .map(|id| {
                let node = self.node(*id);
                Column::new(node.result_name.clone(), node.result_type.clone())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScalarValue;

    fn schema() -> Schema {
        Schema::new(vec![
            Column::new("a", DataType::Int64),
            Column::new("b", DataType::String),
        ])
    }

    #[test]
    fn inputs_become_outputs() {
        let dag = Dag::from_schema(&schema());
        assert_eq!(dag.output().len(), 2);
        assert_eq!(dag.output_schema().names(), vec!["a", "b"]);
    }

    #[test]
    fn add_or_replace_keeps_position() {
        let mut dag = Dag::from_schema(&schema());
        let a = dag.input_at(0).unwrap();
        let wrapped = dag.add_function(
            "toNullable",
            vec![a],
            DataType::Nullable(Box::new(DataType::Int64)),
            "a".to_string(),
        );
        dag.add_or_replace_output(wrapped);
        assert_eq!(dag.output().len(), 2);
        assert_eq!(dag.output_schema().names(), vec!["a", "b"]);
        assert!(dag.output_schema().column_at(0).unwrap().data_type.is_nullable());
    }

    #[test]
    fn project_renames_through_aliases() {
        let mut dag = Dag::from_schema(&schema());
        dag.project(&[("b".to_string(), "name".to_string()), ("a".to_string(), "a".to_string())])
            .unwrap();
        assert_eq!(dag.output_schema().names(), vec!["name", "a"]);
        let missing = dag.project(&[("zzz".to_string(), "zzz".to_string())]);
        assert!(missing.is_err());
    }

    #[test]
    fn constants_are_not_outputs_until_published() {
        let mut dag = Dag::from_schema(&schema());
        let c = dag.add_constant(
            TypedValue::new(DataType::Int32, ScalarValue::Int32(7)),
            "7".to_string(),
        );
        assert_eq!(dag.output().len(), 2);
        dag.add_or_replace_output(c);
        assert_eq!(dag.output().len(), 3);
    }
}
