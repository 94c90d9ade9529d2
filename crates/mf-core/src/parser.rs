//! Result parser: routes each document's row into the frame for its
//! labels ID, creating frames on first sight.

use crate::frame::Frame;
use crate::model::{DocumentError, ResolvedQueryModel};
use crate::panic_guard;
use bson::Document;
use std::collections::HashMap;

pub struct ResultParser {
    model: ResolvedQueryModel,
    frames: Vec<Frame>,
    index: HashMap<String, usize>,
}

impl ResultParser {
    pub fn new(model: ResolvedQueryModel) -> Self {
        Self {
            model,
            frames: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Parse one document. A panic raised while parsing is logged with the
    /// document and its backtrace, then returned as an error.
    pub fn parse_document(&mut self, doc: &Document) -> Result<(), DocumentError> {
        match panic_guard::catch(|| self.parse_unguarded(doc)) {
            Ok(result) => result,
            Err(caught) => {
                tracing::error!(
                    document = %doc,
                    backtrace = %caught.backtrace,
                    "Panic while parsing document: {}",
                    caught.message
                );
                Err(DocumentError::Panic(caught.message))
            }
        }
    }

    fn parse_unguarded(&mut self, doc: &Document) -> Result<(), DocumentError> {
        let (labels, labels_id) = self.model.labels(doc);
        let ix = match self.index.get(&labels_id) {
            Some(&ix) => ix,
            None => {
                let frame = self.model.make_frame(&labels_id, &labels)?;
                tracing::debug!("Created frame for labels ID {:?}", labels_id);
                self.frames.push(frame);
                self.index.insert(labels_id, self.frames.len() - 1);
                self.frames.len() - 1
            }
        };
        let row = self.model.values(doc)?;
        tracing::trace!(?row, "Parsed row");
        self.frames[ix].append_row(row)?;
        Ok(())
    }

    /// Frames in order of first appearance.
    pub fn into_frames(self) -> Vec<Frame> {
        self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Cell, Field, FieldType};
    use crate::model::QueryModel;
    use bson::doc;
    use serde_json::json;

    fn parser(model: serde_json::Value, fields: Vec<Field>) -> ResultParser {
        let model: QueryModel = serde_json::from_value(model).unwrap();
        ResultParser::new(model.resolve(fields).unwrap())
    }

    #[test]
    fn test_partitions_by_labels_id() {
        let mut p = parser(
            json!({"queryType": "Timeseries", "timestampField": "t", "labelFields": ["k"]}),
            vec![Field::new("v", FieldType::Float64)],
        );
        let t = |s| bson::DateTime::from_millis(s);
        for (ts, k, v) in [(1, "A", 1.0), (2, "B", 2.0), (3, "A", 3.0)] {
            p.parse_document(&doc! { "t": t(ts), "k": k, "v": v }).unwrap();
        }
        let frames = p.into_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].name, "k=A");
        assert_eq!(
            frames[0].column("v").unwrap().values,
            vec![Some(Cell::Float64(1.0)), Some(Cell::Float64(3.0))]
        );
        assert_eq!(frames[1].name, "k=B");
        assert_eq!(frames[1].len(), 1);
    }

    #[test]
    fn test_failed_document_leaves_frame_untouched() {
        let mut p = parser(json!({}), vec![Field::new("a", FieldType::Int64)]);
        p.parse_document(&doc! { "a": 1_i64 }).unwrap();
        assert!(p.parse_document(&doc! { "a": "x" }).is_err());
        let frames = p.into_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 1);
    }
}
