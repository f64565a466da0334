//! Procedural macros used by `posecam`.
//!
//! Do not use this crate directly, use `posecam` instead.

use proc_macro::{Span, TokenStream};
use quote::quote;
use syn::{parse::Error, ItemFn};

/// Runs the annotated `main` function on a background thread while the GUI event loop takes over
/// the main thread.
///
/// Logging is initialized before `main` is invoked. When `main` returns, the process exits with a
/// status derived from its return value.
#[proc_macro_attribute]
pub fn main(args: TokenStream, item: TokenStream) -> TokenStream {
    match expand_main(args, item.clone()) {
        Ok(tokens) => tokens,
        Err(err) => {
            // Keep the original item around so that IDEs still see the function.
            let mut error = item;
            error.extend(TokenStream::from(err.to_compile_error()));
            error
        }
    }
}

fn expand_main(args: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    if !args.is_empty() {
        return Err(Error::new(
            Span::call_site().into(),
            "`#[posecam::main]` does not accept arguments",
        ));
    }

    let item = syn::parse::<ItemFn>(item)?;

    if item.sig.ident != "main" {
        return Err(Error::new(
            item.sig.ident.span(),
            "`#[posecam::main]` must be applied to a function called `main`",
        ));
    }
    if item.sig.asyncness.is_some() {
        return Err(Error::new(
            item.sig.ident.span(),
            "`#[posecam::main]` cannot be applied to an `async fn`; \
            run the pose loop on a runtime inside `main` instead",
        ));
    }

    Ok(quote! {
        fn main() {
            #item

            ::posecam::init_logger!();

            ::posecam::run(main);
        }
    }
    .into())
}
