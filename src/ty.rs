/// Type descriptors stamped onto declarations and expressions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
  Int,
  Ptr(Box<Type>),
  Func { return_ty: Box<Type>, params: Vec<Type> },
}

impl Type {
  pub fn int() -> Self {
    Self::Int
  }

  pub fn pointer_to(base: Type) -> Self {
    Self::Ptr(Box::new(base))
  }

  pub fn func(return_ty: Type, params: Vec<Type>) -> Self {
    Self::Func {
      return_ty: Box::new(return_ty),
      params,
    }
  }

  pub fn is_integer(&self) -> bool {
    matches!(self, Self::Int)
  }

  pub fn is_pointer(&self) -> bool {
    matches!(self, Self::Ptr(_))
  }

  pub fn base(&self) -> Option<&Type> {
    match self {
      Self::Ptr(base) => Some(base),
      _ => None,
    }
  }

  /// Storage size in bytes. Functions are not values, so they have none.
  pub fn size(&self) -> i64 {
    match self {
      Self::Int | Self::Ptr(_) => 8,
      Self::Func { .. } => 0,
    }
  }

  pub fn params(&self) -> &[Type] {
    match self {
      Self::Func { params, .. } => params,
      _ => &[],
    }
  }
}

pub fn pointer_to(base: Type) -> Type {
  Type::pointer_to(base)
}
