//! Parsing of dbus type signatures into a tree of [`Type`]s.
//!
//! The signature alphabet is a flat string but containers nest, so this
//! parses it once via recursive descent into a tree that the marshaller and
//! unmarshaller both walk as a "plan". This avoids threading a mutable
//! remaining-signature stack through every container encode/decode call.

const MAX_SIGNATURE_LEN: usize = 255;
const MAX_NESTING_DEPTH: u8 = 32;

/// A base (non-container) type.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Base {
    Byte,
    Boolean,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Double,
    String,
    ObjectPath,
    Signature,
    UnixFd,
}

/// A container type.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Container {
    Array(Box<Type>),
    Struct(Vec<Type>),
    Dict(Base, Box<Type>),
    Variant,
}

/// Either a base type or a container, the node of a signature's type plan.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Type {
    Base(Base),
    Container(Container),
}

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("signature is not valid")]
    InvalidSignature,
    #[error("signature is longer than 255 bytes")]
    SignatureTooLong,
    #[error("signature nests containers more than 32 levels deep")]
    NestingTooDeep,
    #[error("signature must not be empty")]
    EmptySignature,
}

type Result<T> = std::result::Result<T, Error>;

impl Base {
    pub fn code(self) -> char {
        match self {
            Base::Byte => 'y',
            Base::Boolean => 'b',
            Base::Int16 => 'n',
            Base::Uint16 => 'q',
            Base::Int32 => 'i',
            Base::Uint32 => 'u',
            Base::Int64 => 'x',
            Base::Uint64 => 't',
            Base::Double => 'd',
            Base::String => 's',
            Base::ObjectPath => 'o',
            Base::Signature => 'g',
            Base::UnixFd => 'h',
        }
    }

    pub fn alignment(self) -> usize {
        match self {
            Base::Boolean => 4,
            Base::Byte => 1,
            Base::Int16 | Base::Uint16 => 2,
            Base::Int32 | Base::Uint32 | Base::UnixFd => 4,
            Base::Int64 | Base::Uint64 | Base::Double => 8,
            Base::String | Base::ObjectPath => 4,
            Base::Signature => 1,
        }
    }

    fn from_code(c: char) -> Option<Base> {
        Some(match c {
            'y' => Base::Byte,
            'b' => Base::Boolean,
            'n' => Base::Int16,
            'q' => Base::Uint16,
            'i' => Base::Int32,
            'u' => Base::Uint32,
            'x' => Base::Int64,
            't' => Base::Uint64,
            'd' => Base::Double,
            's' => Base::String,
            'o' => Base::ObjectPath,
            'g' => Base::Signature,
            'h' => Base::UnixFd,
            _ => return None,
        })
    }
}

impl Container {
    pub fn alignment(&self) -> usize {
        match self {
            Container::Variant => 1,
            Container::Array(_) => 4,
            Container::Dict(_, _) => 4,
            Container::Struct(_) => 8,
        }
    }

    pub fn to_str(&self, buf: &mut String) {
        match self {
            Container::Array(el) => {
                buf.push('a');
                el.to_str(buf);
            }
            Container::Dict(key, val) => {
                buf.push('a');
                buf.push('{');
                buf.push(key.code());
                val.to_str(buf);
                buf.push('}');
            }
            Container::Struct(fields) => {
                buf.push('(');
                for f in fields {
                    f.to_str(buf);
                }
                buf.push(')');
            }
            Container::Variant => buf.push('v'),
        }
    }
}

impl Type {
    pub fn alignment(&self) -> usize {
        match self {
            Type::Base(b) => b.alignment(),
            Type::Container(c) => c.alignment(),
        }
    }

    pub fn to_str(&self, buf: &mut String) {
        match self {
            Type::Base(b) => buf.push(b.code()),
            Type::Container(c) => c.to_str(buf),
        }
    }

    pub fn to_signature(&self) -> String {
        let mut s = String::new();
        self.to_str(&mut s);
        s
    }

    /// Parse a full signature string (zero or more complete types) into a
    /// plan. Used for message bodies, which may carry several top-level
    /// values.
    pub fn parse(sig: &str) -> Result<Vec<Type>> {
        if sig.len() > MAX_SIGNATURE_LEN {
            return Err(Error::SignatureTooLong);
        }
        let mut chars = sig.chars().peekable();
        let mut types = Vec::new();
        while chars.peek().is_some() {
            types.push(Self::parse_one(&mut chars)?);
        }
        for t in &types {
            t.check_depth(0, 0)?;
        }
        Ok(types)
    }

    /// Parse a signature that must describe exactly one type (e.g. the
    /// inner signature of a variant, or a header field's declared type).
    pub fn parse_single(sig: &str) -> Result<Type> {
        if sig.is_empty() {
            return Err(Error::EmptySignature);
        }
        let mut types = Self::parse(sig)?;
        if types.len() != 1 {
            return Err(Error::InvalidSignature);
        }
        Ok(types.remove(0))
    }

    fn check_depth(&self, struct_depth: u8, array_depth: u8) -> Result<()> {
        if struct_depth >= MAX_NESTING_DEPTH || array_depth >= MAX_NESTING_DEPTH {
            return Err(Error::NestingTooDeep);
        }
        match self {
            Type::Base(_) => Ok(()),
            Type::Container(Container::Struct(fields)) => {
                for f in fields {
                    f.check_depth(struct_depth + 1, array_depth)?;
                }
                Ok(())
            }
            Type::Container(Container::Array(elem)) => elem.check_depth(struct_depth, array_depth + 1),
            Type::Container(Container::Dict(_, elem)) => elem.check_depth(struct_depth, array_depth + 1),
            Type::Container(Container::Variant) => Ok(()),
        }
    }

    fn parse_one(chars: &mut std::iter::Peekable<std::str::Chars>) -> Result<Type> {
        let c = chars.next().ok_or(Error::InvalidSignature)?;
        match c {
            '(' => {
                let mut fields = Vec::new();
                loop {
                    match chars.peek() {
                        Some(')') => {
                            chars.next();
                            break;
                        }
                        Some(_) => fields.push(Self::parse_one(chars)?),
                        None => return Err(Error::InvalidSignature),
                    }
                }
                if fields.is_empty() {
                    return Err(Error::InvalidSignature);
                }
                Ok(Type::Container(Container::Struct(fields)))
            }
            ')' | '}' => Err(Error::InvalidSignature),
            'a' => {
                let next = chars.peek().copied().ok_or(Error::InvalidSignature)?;
                if next == '{' {
                    chars.next();
                    let key_code = chars.next().ok_or(Error::InvalidSignature)?;
                    let key = Base::from_code(key_code).ok_or(Error::InvalidSignature)?;
                    let value = Self::parse_one(chars)?;
                    if chars.next() != Some('}') {
                        return Err(Error::InvalidSignature);
                    }
                    Ok(Type::Container(Container::Dict(key, Box::new(value))))
                } else {
                    let elem = Self::parse_one(chars)?;
                    Ok(Type::Container(Container::Array(Box::new(elem))))
                }
            }
            'v' => Ok(Type::Container(Container::Variant)),
            other => {
                let base = Base::from_code(other).ok_or(Error::InvalidSignature)?;
                Ok(Type::Base(base))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(sig: &str) {
        let types = Type::parse(sig).unwrap();
        let mut out = String::new();
        for t in &types {
            t.to_str(&mut out);
        }
        assert_eq!(out, sig);
    }

    #[test]
    fn parses_base_types() {
        for sig in ["y", "b", "n", "q", "i", "u", "x", "t", "d", "s", "o", "g", "h", "v"] {
            roundtrip(sig);
        }
    }

    #[test]
    fn parses_containers() {
        roundtrip("(si)");
        roundtrip("a(si)");
        roundtrip("a(sa(sv))");
        roundtrip("a{si}");
        roundtrip("a{s(dv)}");
        roundtrip("su");
    }

    #[test]
    fn rejects_malformed_signatures() {
        assert_eq!(Type::parse("("), Err(Error::InvalidSignature));
        assert_eq!(Type::parse(")"), Err(Error::InvalidSignature));
        assert_eq!(Type::parse("a"), Err(Error::InvalidSignature));
        assert_eq!(Type::parse("a{s}"), Err(Error::InvalidSignature));
        assert_eq!(Type::parse("()"), Err(Error::InvalidSignature));
        assert_eq!(Type::parse("z"), Err(Error::InvalidSignature));
    }

    #[test]
    fn rejects_too_deep_nesting() {
        let nested: String = "a".repeat(33) + "y";
        assert_eq!(Type::parse(&nested), Err(Error::NestingTooDeep));
    }

    #[test]
    fn parse_single_requires_exactly_one_type() {
        assert!(Type::parse_single("u").is_ok());
        assert_eq!(Type::parse_single("uu"), Err(Error::InvalidSignature));
        assert_eq!(Type::parse_single(""), Err(Error::EmptySignature));
    }
}
