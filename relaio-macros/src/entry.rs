use proc_macro2::{Span, TokenStream};
use quote::{quote, quote_spanned};
use syn::parse::Parser;
use syn::{FnArg, ItemFn, ReturnType};

use crate::parse::*;

// syn::AttributeArgs does not implement syn::Parse
type AttributeArgs = syn::punctuated::Punctuated<syn::Meta, syn::Token![,]>;

const KNOWN_ATTRIBUTES: &str = "`io_method`, `max_concurrency`, `io_workers`, `shared_buffers`";

/// Expands
///
/// ```rust,no_run
/// #[relaio::test(io_method = "sync")]
/// fn my_test(aio: &relaio::Aio) -> anyhow::Result<()> {
///     Ok(())
/// }
/// ```
///
/// into a plain `#[test]` that builds the subsystem, attaches the test
/// thread and runs the original body as a closure over `&Aio`.
pub(crate) fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    // On errors still expand to something close to the input, so IDE
    // completions keep working.
    let input: ItemFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return token_stream_with_error(item, e),
    };

    let config = if let Some(attr) = input.attrs.iter().find(|attr| is_test_attribute(attr)) {
        let msg = "second test attribute is supplied, consider removing or changing the order of your test attributes";
        Err(syn::Error::new_spanned(attr, msg))
    } else {
        AttributeArgs::parse_terminated
            .parse2(args)
            .and_then(|args| build_config(&input, args))
    };

    match config {
        Ok(config) => expand(input, config),
        Err(e) => token_stream_with_error(expand(input, FinalConfig::default()), e),
    }
}

#[derive(Clone, Copy, PartialEq)]
enum IoMethod {
    Sync,
    Worker,
    IoUring,
}

impl IoMethod {
    fn from_str(s: &str) -> Result<IoMethod, String> {
        match s {
            "sync" => Ok(IoMethod::Sync),
            "worker" => Ok(IoMethod::Worker),
            "io_uring" => Ok(IoMethod::IoUring),
            _ => Err(format!(
                "No such io method `{s}`. The io methods are `sync`, `worker` and `io_uring`."
            )),
        }
    }

    fn tokens(self) -> TokenStream {
        match self {
            IoMethod::Sync => quote! { ::relaio::IoMethod::Sync },
            IoMethod::Worker => quote! { ::relaio::IoMethod::Worker },
            IoMethod::IoUring => quote! { ::relaio::IoMethod::IoUring },
        }
    }
}

struct FinalConfig {
    io_method: IoMethod,
    max_concurrency: Option<usize>,
    io_workers: Option<usize>,
    shared_buffers: Option<usize>,
}

impl Default for FinalConfig {
    fn default() -> Self {
        FinalConfig {
            io_method: IoMethod::Worker,
            max_concurrency: None,
            io_workers: None,
            shared_buffers: None,
        }
    }
}

#[derive(Default)]
struct ConfigBuilder {
    io_method: Option<IoMethod>,
    max_concurrency: Option<usize>,
    io_workers: Option<(usize, Span)>,
    shared_buffers: Option<usize>,
}

fn set_once<T>(slot: &mut Option<T>, value: T, span: Span, field: &str) -> Result<(), syn::Error> {
    if slot.is_some() {
        return Err(syn::Error::new(span, format!("`{field}` set multiple times.")));
    }
    *slot = Some(value);
    Ok(())
}

impl ConfigBuilder {
    fn set(&mut self, name: &str, lit: &syn::Lit, span: Span) -> Result<(), syn::Error> {
        match name {
            "io_method" => {
                let method = IoMethod::from_str(&parse_string(lit, span, name)?)
                    .map_err(|err| syn::Error::new(span, err))?;
                set_once(&mut self.io_method, method, span, name)
            }
            "max_concurrency" => {
                let value = parse_int(lit, span, name)?;
                if value == 0 {
                    return Err(syn::Error::new(span, "`max_concurrency` may not be 0."));
                }
                set_once(&mut self.max_concurrency, value, span, name)
            }
            "io_workers" => {
                let value = parse_int(lit, span, name)?;
                if value == 0 {
                    return Err(syn::Error::new(span, "`io_workers` may not be 0."));
                }
                set_once(&mut self.io_workers, (value, span), span, name)
            }
            "shared_buffers" => {
                let value = parse_int(lit, span, name)?;
                set_once(&mut self.shared_buffers, value, span, name)
            }
            name => Err(syn::Error::new(
                span,
                format!("Unknown attribute {name} is specified; expected one of: {KNOWN_ATTRIBUTES}."),
            )),
        }
    }

    fn build(self) -> Result<FinalConfig, syn::Error> {
        let io_method = self.io_method.unwrap_or(IoMethod::Worker);

        let io_workers = match (io_method, self.io_workers) {
            (IoMethod::Worker, workers) => workers.map(|(n, _)| n),
            (_, Some((_, span))) => {
                let msg = "The `io_workers` option requires the worker io method. Use `#[relaio::test(io_method = \"worker\")]`";
                return Err(syn::Error::new(span, msg));
            }
            (_, None) => None,
        };

        Ok(FinalConfig {
            io_method,
            max_concurrency: self.max_concurrency,
            io_workers,
            shared_buffers: self.shared_buffers,
        })
    }
}

fn build_config(input: &ItemFn, args: AttributeArgs) -> Result<FinalConfig, syn::Error> {
    if let Some(asyncness) = input.sig.asyncness {
        let msg = "relaio tests are synchronous, remove the `async` keyword";
        return Err(syn::Error::new_spanned(asyncness, msg));
    }

    match input.sig.inputs.len() {
        0 => {}
        1 => {
            if let Some(FnArg::Receiver(recv)) = input.sig.inputs.first() {
                return Err(syn::Error::new_spanned(recv, "tests cannot take `self`"));
            }
        }
        _ => {
            let msg = "tests take at most one argument, a `&relaio::Aio`";
            return Err(syn::Error::new_spanned(&input.sig.inputs, msg));
        }
    }

    let mut config = ConfigBuilder::default();

    for arg in args {
        match arg {
            syn::Meta::NameValue(namevalue) => {
                let ident = namevalue
                    .path
                    .get_ident()
                    .ok_or_else(|| {
                        syn::Error::new_spanned(&namevalue, "Must have specified ident")
                    })?
                    .to_string()
                    .to_lowercase();
                let lit = match &namevalue.value {
                    syn::Expr::Lit(syn::ExprLit { lit, .. }) => lit,
                    expr => return Err(syn::Error::new_spanned(expr, "Must be a literal")),
                };
                config.set(&ident, lit, lit.span())?;
            }
            syn::Meta::Path(path) => {
                let name = path
                    .get_ident()
                    .ok_or_else(|| syn::Error::new_spanned(&path, "Must have specified ident"))?
                    .to_string();
                let msg = match name.as_str() {
                    "sync" | "worker" | "io_uring" => {
                        format!("Set the io method with #[relaio::test(io_method = \"{name}\")].")
                    }
                    "io_method" | "max_concurrency" | "io_workers" | "shared_buffers" => {
                        format!("The `{name}` attribute requires an argument.")
                    }
                    name => format!(
                        "Unknown attribute {name} is specified; expected one of: {KNOWN_ATTRIBUTES}."
                    ),
                };
                return Err(syn::Error::new_spanned(path, msg));
            }
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "Unknown attribute inside the macro",
                ));
            }
        }
    }

    config.build()
}

fn expand(mut input: ItemFn, config: FinalConfig) -> TokenStream {
    let name = input.sig.ident.to_string();
    let span = input.sig.ident.span();

    let method = config.io_method.tokens();
    let mut builder = quote_spanned! {span=>
        ::relaio::Builder::new().io_method(#method)
    };
    if let Some(v) = config.max_concurrency {
        let v = v as i32;
        builder = quote_spanned! {span=> #builder.io_max_concurrency(#v) };
    }
    if let Some(v) = config.io_workers {
        builder = quote_spanned! {span=> #builder.io_workers(#v) };
    }
    if let Some(v) = config.shared_buffers {
        builder = quote_spanned! {span=> #builder.shared_buffers(#v) };
    }

    let output = match &input.sig.output {
        ReturnType::Default => quote! { () },
        ReturnType::Type(_, ty) => quote! { #ty },
    };

    let params = std::mem::take(&mut input.sig.inputs);
    let param = params.first().map_or_else(
        || quote! { _: &::relaio::Aio },
        |arg| quote! { #arg },
    );

    let body = &input.block;
    let attrs = &input.attrs;
    let vis = &input.vis;
    let sig = &input.sig;

    quote! {
        #(#attrs)*
        #[::core::prelude::v1::test]
        #vis #sig {
            let _ = ::tracing_subscriber::fmt()
                .with_env_filter(::tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();

            let data_dir = ::tempfile::TempDir::new().expect("failed to create data directory");

            #[allow(clippy::expect_used)]
            let aio = match #builder.data_dir(data_dir.path()).try_build() {
                Ok(aio) => aio,
                Err(e) if ::relaio::__private::is_unsupported(&e) => {
                    eprintln!("skipping {}: {}", #name, e);
                    return <#output as ::relaio::__private::Skip>::skipped();
                }
                Err(e) => panic!("failed building the Aio subsystem: {e}"),
            };
            let backend = aio.attach().expect("failed to attach the test thread");

            let body = |#param| -> #output #body;
            let res = body(&aio);

            drop(backend);
            aio.shutdown();
            res
        }
    }
}
