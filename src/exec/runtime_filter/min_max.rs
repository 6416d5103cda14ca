// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Min/max runtime filter over build-side key values.

use arrow::array::{
    Array, ArrayRef, Date32Array, Float32Array, Float64Array, Int8Array, Int16Array, Int32Array,
    Int64Array, StringArray, TimestampMicrosecondArray, TimestampMillisecondArray,
    TimestampNanosecondArray, TimestampSecondArray,
};
use arrow::datatypes::{DataType, TimeUnit};

#[derive(Clone, Debug, PartialEq)]
enum MinMaxState {
    /// Type is not supported; the filter must not prune anything.
    AlwaysTrue,
    /// No non-null value seen yet.
    Empty,
    Int { min: i64, max: i64 },
    Float { min: f64, max: f64 },
    Utf8 { min: String, max: String },
}

#[derive(Clone, Debug)]
pub struct RuntimeMinMaxFilter {
    data_type: DataType,
    state: MinMaxState,
}

impl RuntimeMinMaxFilter {
    pub fn new(data_type: &DataType) -> Self {
        let state = if is_supported(data_type) {
            MinMaxState::Empty
        } else {
            MinMaxState::AlwaysTrue
        };
        Self {
            data_type: data_type.clone(),
            state,
        }
    }

    pub fn data_type(&self) -> &DataType {
        &self.data_type
    }

    pub fn is_always_true(&self) -> bool {
        self.state == MinMaxState::AlwaysTrue
    }

    pub fn is_empty(&self) -> bool {
        self.state == MinMaxState::Empty
    }

    pub fn int_bounds(&self) -> Option<(i64, i64)> {
        match &self.state {
            MinMaxState::Int { min, max } => Some((*min, *max)),
            _ => None,
        }
    }

    pub fn float_bounds(&self) -> Option<(f64, f64)> {
        match &self.state {
            MinMaxState::Float { min, max } => Some((*min, *max)),
            _ => None,
        }
    }

    pub fn utf8_bounds(&self) -> Option<(&str, &str)> {
        match &self.state {
            MinMaxState::Utf8 { min, max } => Some((min.as_str(), max.as_str())),
            _ => None,
        }
    }

    /// Fold the non-null values of `array` into the bounds. Null values never
    /// participate in min/max pruning.
    pub fn update_array(&mut self, array: &ArrayRef) -> Result<(), String> {
        if self.is_always_true() {
            return Ok(());
        }
        if array.data_type() != &self.data_type {
            return Err(format!(
                "min-max filter type mismatch: filter={:?} array={:?}",
                self.data_type,
                array.data_type()
            ));
        }
        match array.data_type() {
            DataType::Int8 => self.update_ints(downcast::<Int8Array>(array)?.iter().map(|v| v.map(i64::from))),
            DataType::Int16 => self.update_ints(downcast::<Int16Array>(array)?.iter().map(|v| v.map(i64::from))),
            DataType::Int32 => self.update_ints(downcast::<Int32Array>(array)?.iter().map(|v| v.map(i64::from))),
            DataType::Int64 => self.update_ints(downcast::<Int64Array>(array)?.iter()),
            DataType::Date32 => self.update_ints(downcast::<Date32Array>(array)?.iter().map(|v| v.map(i64::from))),
            DataType::Timestamp(TimeUnit::Second, _) => {
                self.update_ints(downcast::<TimestampSecondArray>(array)?.iter())
            }
            DataType::Timestamp(TimeUnit::Millisecond, _) => {
                self.update_ints(downcast::<TimestampMillisecondArray>(array)?.iter())
            }
            DataType::Timestamp(TimeUnit::Microsecond, _) => {
                self.update_ints(downcast::<TimestampMicrosecondArray>(array)?.iter())
            }
            DataType::Timestamp(TimeUnit::Nanosecond, _) => {
                self.update_ints(downcast::<TimestampNanosecondArray>(array)?.iter())
            }
            DataType::Float32 => {
                self.update_floats(downcast::<Float32Array>(array)?.iter().map(|v| v.map(f64::from)))
            }
            DataType::Float64 => self.update_floats(downcast::<Float64Array>(array)?.iter()),
            DataType::Utf8 => {
                let array = downcast::<StringArray>(array)?;
                for value in array.iter().flatten() {
                    self.update_utf8(value);
                }
            }
            _ => {
                self.state = MinMaxState::AlwaysTrue;
            }
        }
        Ok(())
    }

    fn update_ints(&mut self, values: impl Iterator<Item = Option<i64>>) {
        for value in values.flatten() {
            match &mut self.state {
                MinMaxState::Int { min, max } => {
                    *min = (*min).min(value);
                    *max = (*max).max(value);
                }
                _ => {
                    self.state = MinMaxState::Int {
                        min: value,
                        max: value,
                    };
                }
            }
        }
    }

    fn update_floats(&mut self, values: impl Iterator<Item = Option<f64>>) {
        for value in values.flatten() {
            match &mut self.state {
                MinMaxState::Float { min, max } => {
                    *min = (*min).min(value);
                    *max = (*max).max(value);
                }
                _ => {
                    self.state = MinMaxState::Float {
                        min: value,
                        max: value,
                    };
                }
            }
        }
    }

    fn update_utf8(&mut self, value: &str) {
        match &mut self.state {
            MinMaxState::Utf8 { min, max } => {
                if value < min.as_str() {
                    *min = value.to_string();
                }
                if value > max.as_str() {
                    *max = value.to_string();
                }
            }
            _ => {
                self.state = MinMaxState::Utf8 {
                    min: value.to_string(),
                    max: value.to_string(),
                };
            }
        }
    }
}

fn is_supported(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::Date32
            | DataType::Timestamp(_, _)
            | DataType::Float32
            | DataType::Float64
            | DataType::Utf8
    )
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef) -> Result<&'a T, String> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| "min-max filter array downcast failed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn int_bounds_skip_nulls() {
        let mut filter = RuntimeMinMaxFilter::new(&DataType::Int32);
        assert!(filter.is_empty());
        let array: ArrayRef = Arc::new(Int32Array::from(vec![Some(5), None, Some(-3), Some(9)]));
        filter.update_array(&array).unwrap();
        assert_eq!(filter.int_bounds(), Some((-3, 9)));
        let more: ArrayRef = Arc::new(Int32Array::from(vec![Some(100)]));
        filter.update_array(&more).unwrap();
        assert_eq!(filter.int_bounds(), Some((-3, 100)));
    }

    #[test]
    fn utf8_bounds_are_lexicographic() {
        let mut filter = RuntimeMinMaxFilter::new(&DataType::Utf8);
        let array: ArrayRef = Arc::new(StringArray::from(vec!["pear", "apple", "plum"]));
        filter.update_array(&array).unwrap();
        assert_eq!(filter.utf8_bounds(), Some(("apple", "plum")));
    }

    #[test]
    fn unsupported_type_is_always_true() {
        let filter = RuntimeMinMaxFilter::new(&DataType::Binary);
        assert!(filter.is_always_true());
    }

    #[test]
    fn type_mismatch_is_an_error() {
        let mut filter = RuntimeMinMaxFilter::new(&DataType::Int64);
        let array: ArrayRef = Arc::new(Int32Array::from(vec![1]));
        let err = filter.update_array(&array).unwrap_err();
        assert!(err.contains("type mismatch"), "err={}", err);
    }
}
