use crate::util::Width;
use std::io::{Error, ErrorKind, Result};
use std::iter::Peekable;
use std::str::Chars;

/// Utility trait for converting descriptors to and from string representations
pub trait RenderDescriptor {
    /// Turn the descriptor into a string
    fn render(&self) -> String {
        let mut string = String::new();
        self.render_to(&mut string);
        string
    }

    /// Write the descriptor to a string
    fn render_to(&self, write_to: &mut String);
}

pub trait ParseDescriptor: Sized {
    /// Parse a descriptor from a string
    fn parse(source: &str) -> Result<Self> {
        let mut chars = source.chars().peekable();
        let ret = Self::parse_from(&mut chars)?;
        match chars.next() {
            None => Ok(ret),
            Some(c) => {
                let msg = format!("Unexpected leftover input '{}'", c);
                Err(Error::new(ErrorKind::InvalidInput, msg))
            }
        }
    }

    /// Read the descriptor from a character buffer
    fn parse_from(source: &mut Peekable<Chars>) -> Result<Self>;
}

/// Primitive value types
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum BaseType {
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    Short,
    Boolean,
}

impl Width for BaseType {
    fn width(&self) -> usize {
        match self {
            BaseType::Double | BaseType::Long => 2,
            _ => 1,
        }
    }
}

impl RenderDescriptor for BaseType {
    fn render_to(&self, write_to: &mut String) {
        let c = match self {
            BaseType::Byte => 'B',
            BaseType::Char => 'C',
            BaseType::Double => 'D',
            BaseType::Float => 'F',
            BaseType::Int => 'I',
            BaseType::Long => 'J',
            BaseType::Short => 'S',
            BaseType::Boolean => 'Z',
        };
        write_to.push(c);
    }
}

impl ParseDescriptor for BaseType {
    fn parse_from(source: &mut Peekable<Chars>) -> Result<Self> {
        let typ = match source.next() {
            Some('B') => BaseType::Byte,
            Some('C') => BaseType::Char,
            Some('D') => BaseType::Double,
            Some('F') => BaseType::Float,
            Some('I') => BaseType::Int,
            Some('J') => BaseType::Long,
            Some('S') => BaseType::Short,
            Some('Z') => BaseType::Boolean,
            Some(c) => {
                let msg = format!("Invalid base type character '{}'", c);
                return Err(Error::new(ErrorKind::InvalidInput, msg));
            }
            None => {
                let msg = "Missing base type character";
                return Err(Error::new(ErrorKind::UnexpectedEof, msg));
            }
        };
        Ok(typ)
    }
}

/// Type of a field, parameter, or return value
///
/// Class names are kept in their internal (slash-separated) form.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum FieldType {
    Base(BaseType),
    Object(String),
    Array(Box<FieldType>),
}

impl Width for FieldType {
    fn width(&self) -> usize {
        match self {
            FieldType::Base(base_type) => base_type.width(),
            FieldType::Object(_) | FieldType::Array(_) => 1,
        }
    }
}

impl RenderDescriptor for FieldType {
    fn render_to(&self, write_to: &mut String) {
        match self {
            FieldType::Base(base_type) => base_type.render_to(write_to),
            FieldType::Object(class_name) => {
                write_to.push('L');
                write_to.push_str(class_name);
                write_to.push(';');
            }
            FieldType::Array(element_type) => {
                write_to.push('[');
                element_type.render_to(write_to);
            }
        }
    }
}

impl ParseDescriptor for FieldType {
    fn parse_from(source: &mut Peekable<Chars>) -> Result<Self> {
        match source.peek().copied() {
            None => Err(Error::new(ErrorKind::UnexpectedEof, "Missing field type")),
            Some('B' | 'C' | 'D' | 'F' | 'I' | 'J' | 'S' | 'Z') => {
                BaseType::parse_from(source).map(FieldType::Base)
            }
            Some('[') => {
                source.next();
                Ok(FieldType::Array(Box::new(FieldType::parse_from(source)?)))
            }
            Some('L') => {
                source.next();
                let mut class_name = String::new();
                loop {
                    match source.next() {
                        Some(';') if !class_name.is_empty() => {
                            return Ok(FieldType::Object(class_name))
                        }
                        Some(';') => {
                            let msg = "Empty class name in object type";
                            return Err(Error::new(ErrorKind::InvalidInput, msg));
                        }
                        Some(c) => class_name.push(c),
                        None => {
                            let msg = format!("Missing terminator for 'L{}'", class_name);
                            return Err(Error::new(ErrorKind::UnexpectedEof, msg));
                        }
                    }
                }
            }
            Some(c) => {
                let msg = format!("Invalid field type character '{}'", c);
                Err(Error::new(ErrorKind::InvalidInput, msg))
            }
        }
    }
}

/// Signature of a method
#[derive(PartialEq, Eq, Hash, Debug, Clone)]
pub struct MethodDescriptor {
    pub parameters: Vec<FieldType>,
    pub return_type: Option<FieldType>, // `None` is for `void` (ie. no return)
}

impl MethodDescriptor {
    /// Total number of local variable words taken by the parameters (not the same as the length
    /// of the vector)
    pub fn parameter_length(&self, has_this_param: bool) -> usize {
        let this_len = if has_this_param { 1 } else { 0 };
        this_len + self.parameters.iter().map(Width::width).sum::<usize>()
    }

    /// Number of stack words taken by the return value
    pub fn return_length(&self) -> usize {
        self.return_type.as_ref().map_or(0, Width::width)
    }
}

impl RenderDescriptor for MethodDescriptor {
    fn render_to(&self, write_to: &mut String) {
        write_to.push('(');
        for parameter in &self.parameters {
            parameter.render_to(write_to);
        }
        write_to.push(')');
        match &self.return_type {
            None => write_to.push('V'),
            Some(typ) => typ.render_to(write_to),
        };
    }
}

impl ParseDescriptor for MethodDescriptor {
    fn parse_from(source: &mut Peekable<Chars>) -> Result<Self> {
        if source.next() != Some('(') {
            let msg = "Expected '(' for method";
            return Err(Error::new(ErrorKind::InvalidInput, msg));
        }

        let mut parameters = vec![];
        loop {
            match source.peek().copied() {
                Some(')') => {
                    source.next();
                    break;
                }
                None => {
                    let msg = "Missing ')' in method descriptor";
                    return Err(Error::new(ErrorKind::UnexpectedEof, msg));
                }
                Some(_) => parameters.push(FieldType::parse_from(source)?),
            }
        }

        let return_type = if source.next_if_eq(&'V').is_some() {
            None
        } else {
            Some(FieldType::parse_from(source)?)
        };

        Ok(MethodDescriptor {
            parameters,
            return_type,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn field_types() {
        assert_eq!(FieldType::parse("I").unwrap(), FieldType::Base(BaseType::Int));
        assert_eq!(
            FieldType::parse("[[Ljava/lang/String;").unwrap(),
            FieldType::Array(Box::new(FieldType::Array(Box::new(FieldType::Object(
                String::from("java/lang/String")
            )))))
        );
        assert!(FieldType::parse("Ljava/lang/String").is_err());
        assert!(FieldType::parse("II").is_err());
        assert!(FieldType::parse("L;").is_err());
        assert!(FieldType::parse("V").is_err());
    }

    #[test]
    fn method_descriptors() {
        let desc = MethodDescriptor::parse("(IJ[DLjava/lang/Object;)D").unwrap();
        assert_eq!(desc.parameters.len(), 4);
        assert_eq!(desc.parameter_length(false), 5);
        assert_eq!(desc.parameter_length(true), 6);
        assert_eq!(desc.return_length(), 2);
        assert_eq!(desc.render(), "(IJ[DLjava/lang/Object;)D");

        let void = MethodDescriptor::parse("()V").unwrap();
        assert_eq!(void.return_type, None);
        assert_eq!(void.return_length(), 0);

        assert!(MethodDescriptor::parse("(I").is_err());
        assert!(MethodDescriptor::parse("I)V").is_err());
    }
}
