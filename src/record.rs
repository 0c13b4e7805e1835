use std::sync::Arc;

/// Ordered, fixed list of field names for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    fields: Vec<String>,
}

impl Schema {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Schema {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn index_of(&self, field: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.index_of(field).is_some()
    }
}

/// One row. Values line up with the schema; `None` is the absent marker and
/// is never the same thing as `Some("")`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    schema: Arc<Schema>,
    values: Vec<Option<String>>,
}

impl Record {
    /// Record with every field absent.
    pub fn empty(schema: &Arc<Schema>) -> Self {
        Record {
            schema: Arc::clone(schema),
            values: vec![None; schema.len()],
        }
    }

    /// Build from (field, value) pairs. Fields outside the schema are ignored.
    pub fn from_pairs<'a, I>(schema: &Arc<Schema>, pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, Option<&'a str>)>,
    {
        let mut record = Record::empty(schema);
        for (field, value) in pairs {
            record.set(field, value.map(str::to_string));
        }
        record
    }

    /// Build from positional values. Short rows are padded with absent values,
    /// long rows are truncated to the schema width.
    pub fn from_values(schema: &Arc<Schema>, mut values: Vec<Option<String>>) -> Self {
        values.resize(schema.len(), None);
        Record {
            schema: Arc::clone(schema),
            values,
        }
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        let idx = self.schema.index_of(field)?;
        self.values[idx].as_deref()
    }

    /// Returns false when `field` is not part of the schema.
    pub fn set(&mut self, field: &str, value: Option<String>) -> bool {
        match self.schema.index_of(field) {
            Some(idx) => {
                self.values[idx] = value;
                true
            }
            None => false,
        }
    }

    pub fn values(&self) -> &[Option<String>] {
        &self.values
    }
}

/// Ordered sequence of records sharing one schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    schema: Arc<Schema>,
    records: Vec<Record>,
}

impl Dataset {
    pub fn new(schema: Arc<Schema>) -> Self {
        Dataset {
            schema,
            records: Vec::new(),
        }
    }

    pub fn with_records(schema: Arc<Schema>, records: Vec<Record>) -> Self {
        Dataset { schema, records }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

#[cfg(test)]
pub(crate) fn test_schema() -> Arc<Schema> {
    Arc::new(Schema::new([
        "Name",
        "Address",
        "Profession",
        "Phone",
        "Mobile",
        "Website",
        "Email",
        "Hours",
    ]))
}

#[cfg(test)]
pub(crate) fn person(
    schema: &Arc<Schema>,
    name: &str,
    phone: Option<&str>,
    mobile: Option<&str>,
) -> Record {
    Record::from_pairs(
        schema,
        [("Name", Some(name)), ("Phone", phone), ("Mobile", mobile)],
    )
}
