//! Ordered chain of outbound request mutators.
//!
//! Every director sees the request exactly as the directors registered
//! before it left it. Registration order is execution order.

use axum::extract::Request;

pub type Director = Box<dyn Fn(&mut Request) + Send + Sync>;

#[derive(Default)]
pub struct DirectorChain {
    directors: Vec<Director>,
}

impl std::fmt::Debug for DirectorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectorChain")
            .field("len", &self.directors.len())
            .finish()
    }
}

impl DirectorChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F>(&mut self, director: F)
    where
        F: Fn(&mut Request) + Send + Sync + 'static,
    {
        self.directors.push(Box::new(director));
    }

    pub fn push_boxed(&mut self, director: Director) {
        self.directors.push(director);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.directors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.directors.is_empty()
    }

    pub fn direct(&self, req: &mut Request) {
        for director in &self.directors {
            director(req);
        }
    }
}
